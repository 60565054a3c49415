//! Error taxonomy for access decisions
//!
//! `QuotaExceeded` is an answer about the user's allowance.
//! `LedgerUnavailable` means no answer could be computed, and must not be
//! shown to the user as a denial.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::store::StoreError;
use super::types::{EntitlementStatus, Plan};

/// Why a metered request was rejected
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("access denied: {plan} plan is {status}")]
    AccessDenied {
        plan: Plan,
        status: EntitlementStatus,
    },

    #[error("quota exceeded: {balance} units remaining")]
    QuotaExceeded { balance: u32 },

    #[error("too many requests, retry after {}s", retry_after_secs(.retry_after))]
    RateLimited { retry_after: Duration },

    #[error("quota ledger unavailable: {0}")]
    LedgerUnavailable(#[from] StoreError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Stable, serializable reason code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    Unauthenticated,
    AccessDenied,
    QuotaExceeded,
    RateLimited,
    LedgerUnavailable,
    InvalidRequest,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::AccessDenied => "access_denied",
            Self::QuotaExceeded => "quota_exceeded",
            Self::RateLimited => "rate_limited",
            Self::LedgerUnavailable => "ledger_unavailable",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GateError {
    pub fn reason(&self) -> DenialReason {
        match self {
            Self::Unauthenticated => DenialReason::Unauthenticated,
            Self::AccessDenied { .. } => DenialReason::AccessDenied,
            Self::QuotaExceeded { .. } => DenialReason::QuotaExceeded,
            Self::RateLimited { .. } => DenialReason::RateLimited,
            Self::LedgerUnavailable(_) => DenialReason::LedgerUnavailable,
            Self::InvalidRequest(_) => DenialReason::InvalidRequest,
        }
    }

    pub fn code(&self) -> &'static str {
        self.reason().as_str()
    }

    /// Only transient conditions are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::LedgerUnavailable(_))
    }

    pub fn balance(&self) -> Option<u32> {
        match self {
            Self::QuotaExceeded { balance } => Some(*balance),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Whole seconds for a Retry-After hint, never below one
pub fn retry_after_secs(retry_after: &Duration) -> u64 {
    let millis = retry_after.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_for_quota_and_outage() {
        let exceeded = GateError::QuotaExceeded { balance: 0 };
        let outage = GateError::LedgerUnavailable(StoreError::Timeout(Duration::from_secs(5)));

        assert_eq!(exceeded.code(), "quota_exceeded");
        assert_eq!(outage.code(), "ledger_unavailable");
        assert!(!exceeded.is_retryable());
        assert!(outage.is_retryable());
        assert_eq!(exceeded.balance(), Some(0));
        assert_eq!(outage.balance(), None);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(&Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(&Duration::from_millis(1000)), 1);
        assert_eq!(retry_after_secs(&Duration::from_millis(1001)), 2);
        assert_eq!(retry_after_secs(&Duration::ZERO), 1);

        let err = GateError::RateLimited {
            retry_after: Duration::from_millis(59_500),
        };
        assert_eq!(err.to_string(), "too many requests, retry after 60s");
    }

    #[test]
    fn test_reason_serializes_snake_case() {
        let json = serde_json::to_string(&DenialReason::LedgerUnavailable).unwrap();
        assert_eq!(json, "\"ledger_unavailable\"");
    }
}
