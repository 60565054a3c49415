//! Access gate for metered requests
//!
//! Composes the admission limiter, the entitlement evaluator and the quota
//! ledger. Order per request: principal, operation kind, rate limit,
//! entitlement, cap. The first failing stage decides the reason.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::entitlement::CapabilityTier;
use super::error::{retry_after_secs, DenialReason, GateError};
use super::ledger::QuotaLedger;
use super::store::QuotaStore;
use super::types::{
    Entitlement, EntitlementStatus, EntitlementUpdate, PeriodKind, Plan, UsageKind,
};
use crate::config::{GateConfig, PlanPolicies};
use crate::rate_limit::RateLimiter;

/// A request that passed every stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub kind: UsageKind,
    pub capability: CapabilityTier,
    /// Remaining units after the debit; `None` when nothing was capped
    pub balance: Option<u32>,
}

/// Answer handed to the routing layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub balance: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<CapabilityTier>,
}

impl From<Result<Grant, GateError>> for AccessDecision {
    fn from(result: Result<Grant, GateError>) -> Self {
        match result {
            Ok(grant) => Self {
                allowed: true,
                reason: None,
                message: None,
                balance: grant.balance,
                retry_after_secs: None,
                capability: Some(grant.capability),
            },
            Err(err) => Self {
                allowed: false,
                reason: Some(err.reason()),
                message: Some(err.to_string()),
                balance: err.balance(),
                retry_after_secs: err.retry_after().as_ref().map(retry_after_secs),
                capability: None,
            },
        }
    }
}

/// Plan view for "my plan" and "remaining credits" displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSnapshot {
    pub plan: Plan,
    pub status: EntitlementStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub can_use: bool,
    pub capability: CapabilityTier,
    /// `None` for unlimited plans
    pub cap: Option<u32>,
    pub period: Option<PeriodKind>,
    pub balance: Option<u32>,
}

pub struct AccessGate {
    app_id: String,
    ledger: QuotaLedger,
    limiter: Arc<RateLimiter>,
    policies: PlanPolicies,
    rate_limit: usize,
    rate_window: Duration,
}

impl AccessGate {
    pub fn new(config: &GateConfig, store: Arc<dyn QuotaStore>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            app_id: config.app_id.clone(),
            ledger: QuotaLedger::new(store, config.store_timeout),
            limiter,
            policies: config.policies.clone(),
            rate_limit: config.rate_limit,
            rate_window: config.rate_window,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Decide whether a metered call may proceed, debiting it if so
    pub async fn evaluate_access(&self, principal: Option<&str>, operation: &str) -> AccessDecision {
        self.evaluate_access_at(principal, operation, Utc::now()).await
    }

    pub async fn evaluate_access_at(
        &self,
        principal: Option<&str>,
        operation: &str,
        now: DateTime<Utc>,
    ) -> AccessDecision {
        self.authorize_at(principal, operation, now).await.into()
    }

    /// Typed form of [`Self::evaluate_access_at`]
    pub async fn authorize_at(
        &self,
        principal: Option<&str>,
        operation: &str,
        now: DateTime<Utc>,
    ) -> Result<Grant, GateError> {
        let principal = principal
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(GateError::Unauthenticated)?;
        let kind: UsageKind = operation.parse()?;

        let admission = self
            .limiter
            .check(&format!("ai:{}", principal), self.rate_limit, self.rate_window);
        if !admission.allowed {
            return Err(GateError::RateLimited {
                retry_after: admission.retry_after,
            });
        }

        let ent = self.ledger.entitlement_or_default(principal, &self.app_id).await?;
        if !ent.can_use_at(now) {
            info!(
                user = principal,
                plan = %ent.plan,
                status = %ent.status,
                "Access denied by entitlement"
            );
            return Err(GateError::AccessDenied {
                plan: ent.plan,
                status: ent.status,
            });
        }
        let capability = ent.capability();

        let policy = match self.policies.policy_for(ent.plan) {
            Some(policy) if kind.is_metered() => policy,
            _ => {
                // Unlimited plan or auxiliary kind: log it, never cap it
                self.ledger
                    .record_at(principal, &self.app_id, kind, now)
                    .await?;
                debug!(user = principal, kind = %kind, "Uncapped usage recorded");
                return Ok(Grant {
                    kind,
                    capability,
                    balance: None,
                });
            }
        };

        let outcome = self
            .ledger
            .consume_at(
                principal,
                &self.app_id,
                kind,
                kind.weight(),
                &policy,
                ent.current_period_start,
                now,
            )
            .await?;

        if !outcome.accepted {
            info!(
                user = principal,
                plan = %ent.plan,
                used = outcome.used,
                cap = outcome.cap,
                "Quota exceeded"
            );
            return Err(GateError::QuotaExceeded {
                balance: outcome.balance_after,
            });
        }

        Ok(Grant {
            kind,
            capability,
            balance: Some(outcome.balance_after),
        })
    }

    /// Remaining units for the current window; `None` for unlimited plans
    pub async fn balance(&self, principal: &str) -> Result<Option<u32>, GateError> {
        Ok(self.snapshot_at(principal, Utc::now()).await?.balance)
    }

    pub async fn snapshot(&self, principal: &str) -> Result<PlanSnapshot, GateError> {
        self.snapshot_at(principal, Utc::now()).await
    }

    pub async fn snapshot_at(
        &self,
        principal: &str,
        now: DateTime<Utc>,
    ) -> Result<PlanSnapshot, GateError> {
        let principal = principal.trim();
        if principal.is_empty() {
            return Err(GateError::Unauthenticated);
        }

        let ent = self.ledger.entitlement_or_default(principal, &self.app_id).await?;
        let policy = self.policies.policy_for(ent.plan);
        let (cap, balance) = match &policy {
            Some(policy) => {
                let outcome = self
                    .ledger
                    .peek_at(principal, &self.app_id, policy, ent.current_period_start, now)
                    .await?;
                (Some(outcome.cap), Some(outcome.balance_after))
            }
            None => (None, None),
        };

        Ok(PlanSnapshot {
            plan: ent.plan,
            status: ent.status,
            expires_at: ent.expires_at,
            trial_ends_at: ent.trial_ends_at,
            can_use: ent.can_use_at(now),
            capability: ent.capability(),
            cap,
            period: policy.map(|p| p.period),
            balance,
        })
    }

    /// Apply a billing-driven entitlement change
    pub async fn update_entitlement(
        &self,
        principal: &str,
        update: &EntitlementUpdate,
    ) -> Result<Entitlement, GateError> {
        let ent = self
            .ledger
            .update_entitlement(principal, &self.app_id, update)
            .await?;
        info!(user = principal, plan = %ent.plan, status = %ent.status, "Entitlement updated");
        Ok(ent)
    }
}
