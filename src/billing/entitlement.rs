//! Entitlement evaluation
//!
//! Decides from a single row whether the principal may use the app right
//! now. Pure: no I/O and no caching, so it is re-run on every request and
//! picks up webhook-driven changes immediately.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Entitlement, EntitlementStatus, Plan};

/// Upstream model configuration a request is served with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityTier {
    #[default]
    Base,
    Elevated,
}

impl CapabilityTier {
    /// Classify a raw plan name. Anything unrecognised gets the base tier.
    pub fn for_plan(plan: &str) -> Self {
        match plan.trim().to_ascii_lowercase().as_str() {
            "professional" | "pro" | "standard" => Self::Elevated,
            _ => Self::Base,
        }
    }
}

impl From<Plan> for CapabilityTier {
    fn from(plan: Plan) -> Self {
        Self::for_plan(plan.as_str())
    }
}

impl Entitlement {
    /// Active trial that has not yet ended
    pub fn has_trial_access(&self, now: DateTime<Utc>) -> bool {
        self.plan == Plan::Trial
            && self.status == EntitlementStatus::Active
            && self.trial_ends_at.is_some_and(|ends| ends > now)
    }

    /// Any non-trial plan in good standing and not expired
    pub fn has_paid_access(&self, now: DateTime<Utc>) -> bool {
        let status_ok = matches!(
            self.status,
            EntitlementStatus::Active | EntitlementStatus::Trialing
        );
        self.plan != Plan::Trial
            && status_ok
            && self.expires_at.map_or(true, |expires| expires > now)
    }

    pub fn can_use_at(&self, now: DateTime<Utc>) -> bool {
        self.has_trial_access(now) || self.has_paid_access(now)
    }

    pub fn can_use(&self) -> bool {
        self.can_use_at(Utc::now())
    }

    pub fn capability(&self) -> CapabilityTier {
        self.plan.into()
    }
}
