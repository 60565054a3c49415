//! Billing data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use super::error::GateError;

/// Subscription plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Trial,
    Entry,
    Standard,
    Professional,
    /// Legacy name of the top tier, still present on older rows
    Pro,
}

impl Plan {
    pub const ALL: [Plan; 6] = [
        Plan::Free,
        Plan::Trial,
        Plan::Entry,
        Plan::Standard,
        Plan::Professional,
        Plan::Pro,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Trial => "trial",
            Self::Entry => "entry",
            Self::Standard => "standard",
            Self::Professional => "professional",
            Self::Pro => "pro",
        }
    }

    /// Parse a plan name read from the store.
    ///
    /// Rows are written by billing webhooks, so an unknown name is logged and
    /// treated as the unpaid tier rather than rejected.
    pub fn from_db(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            warn!(plan = value, "Unknown plan name, treating as free");
            Self::Free
        })
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "trial" => Ok(Self::Trial),
            "entry" => Ok(Self::Entry),
            "standard" => Ok(Self::Standard),
            "professional" => Ok(Self::Professional),
            "pro" => Ok(Self::Pro),
            other => Err(format!("unknown plan: {}", other)),
        }
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    #[default]
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    /// Placeholder rows that were created without any billing event
    Inactive,
}

impl EntitlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::Inactive => "inactive",
        }
    }

    /// Parse a status read from the store; unknown values never grant access.
    pub fn from_db(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            warn!(status = value, "Unknown entitlement status, treating as inactive");
            Self::Inactive
        })
    }
}

impl std::fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntitlementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "incomplete" => Ok(Self::Incomplete),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// One entitlement row per (principal, app)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub principal: String,
    pub app: String,
    pub plan: Plan,
    pub status: EntitlementStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// Billing-cycle or trial start; usage before it never counts
    pub current_period_start: Option<DateTime<Utc>>,
    pub billing_reference_id: Option<String>,
    pub billing_customer_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    /// Row created lazily on first read: free plan, active, no expiry
    pub fn new_default(principal: &str, app: &str, now: DateTime<Utc>) -> Self {
        Self {
            principal: principal.to_string(),
            app: app.to_string(),
            plan: Plan::Free,
            status: EntitlementStatus::Active,
            expires_at: None,
            trial_ends_at: None,
            current_period_start: None,
            billing_reference_id: None,
            billing_customer_id: None,
            updated_at: now,
        }
    }
}

/// Partial entitlement write.
///
/// `None` leaves a field untouched. For nullable columns the inner option
/// distinguishes "set" from "clear" (`Some(None)`).
/// A missing JSON key leaves the field untouched; an explicit `null` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EntitlementStatus>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub trial_ends_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub billing_reference_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub billing_customer_id: Option<Option<String>>,
}

/// Only called for keys that are present, so `null` becomes `Some(None)`
fn present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl EntitlementUpdate {
    pub fn plan(mut self, plan: Plan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn status(mut self, status: EntitlementStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn expires_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn trial_ends_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.trial_ends_at = Some(at);
        self
    }

    pub fn current_period_start(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.current_period_start = Some(at);
        self
    }

    pub fn billing_ids(mut self, reference: Option<String>, customer: Option<String>) -> Self {
        self.billing_reference_id = Some(reference);
        self.billing_customer_id = Some(customer);
        self
    }

    /// Merge this update onto an existing row
    pub fn apply(&self, target: &mut Entitlement, now: DateTime<Utc>) {
        if let Some(plan) = self.plan {
            target.plan = plan;
        }
        if let Some(status) = self.status {
            target.status = status;
        }
        if let Some(at) = self.expires_at {
            target.expires_at = at;
        }
        if let Some(at) = self.trial_ends_at {
            target.trial_ends_at = at;
        }
        if let Some(at) = self.current_period_start {
            target.current_period_start = at;
        }
        if let Some(id) = &self.billing_reference_id {
            target.billing_reference_id = id.clone();
        }
        if let Some(id) = &self.billing_customer_id {
            target.billing_customer_id = id.clone();
        }
        target.updated_at = now;
    }
}

/// Kind of AI run recorded in the usage log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Generation,
    MultiStepGeneration,
    Refine,
    Extract,
    Analysis,
    Sanitization,
}

impl UsageKind {
    /// Kinds that debit the period allowance
    pub const METERED: [UsageKind; 3] = [
        UsageKind::Generation,
        UsageKind::MultiStepGeneration,
        UsageKind::Refine,
    ];

    /// Units debited per run
    pub fn weight(&self) -> u32 {
        match self {
            Self::MultiStepGeneration => 2,
            _ => 1,
        }
    }

    pub fn is_metered(&self) -> bool {
        Self::METERED.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::MultiStepGeneration => "multi_step_generation",
            Self::Refine => "refine",
            Self::Extract => "extract",
            Self::Analysis => "analysis",
            Self::Sanitization => "sanitization",
        }
    }
}

impl std::fmt::Display for UsageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageKind {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "generation" => Ok(Self::Generation),
            "multi_step_generation" | "multi-step-generation" | "multi-gen" => {
                Ok(Self::MultiStepGeneration)
            }
            "refine" => Ok(Self::Refine),
            "extract" => Ok(Self::Extract),
            "analysis" => Ok(Self::Analysis),
            "sanitization" => Ok(Self::Sanitization),
            other => Err(GateError::InvalidRequest(format!(
                "unknown operation kind: {:?}",
                other
            ))),
        }
    }
}

/// Append-only usage event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: Uuid,
    pub principal: String,
    pub app: String,
    pub kind: UsageKind,
    pub weight: u32,
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(principal: &str, app: &str, kind: UsageKind, weight: u32, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal: principal.to_string(),
            app: app.to_string(),
            kind,
            weight,
            created_at: at,
        }
    }
}

/// Length of a quota period in the civil calendar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Daily,
    Weekly,
    Monthly,
}

/// Allowance for a capped plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaPolicy {
    pub cap: u32,
    pub period: PeriodKind,
    /// Larger cap for a principal's first period
    #[serde(default)]
    pub welcome_cap: Option<u32>,
}

impl QuotaPolicy {
    pub fn new(cap: u32, period: PeriodKind) -> Self {
        Self {
            cap,
            period,
            welcome_cap: None,
        }
    }

    pub fn with_welcome(mut self, welcome_cap: u32) -> Self {
        self.welcome_cap = Some(welcome_cap);
        self
    }
}

/// Result of a check-and-consume against the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeOutcome {
    pub accepted: bool,
    pub balance_after: u32,
    /// Weighted usage in the window, including this debit when accepted
    pub used: u32,
    /// Cap that was applied (welcome cap when it was in effect)
    pub cap: u32,
}
