//! Durable store for entitlements and usage records
//!
//! The ledger only talks to storage through [`QuotaStore`]. Backends that can
//! run check-and-consume as one server-side transaction report it through
//! [`QuotaStore::supports_atomic_consume`]; for the others the ledger
//! serializes sum + append per (principal, app) itself.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

use super::types::{ConsumeOutcome, Entitlement, EntitlementUpdate, UsageKind};

/// Storage failure. Always surfaces as `ledger_unavailable`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store does not support {0}")]
    Unsupported(&'static str),

    #[error("store task failed: {0}")]
    TaskFailed(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Point after which a store call must not commit anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn timeout_error(&self) -> StoreError {
        StoreError::Timeout(self.budget)
    }

    /// `Err(Timeout)` once the deadline has passed
    pub fn check(&self) -> Result<(), StoreError> {
        if self.expired() {
            return Err(self.timeout_error());
        }
        Ok(())
    }
}

/// One atomic check-and-consume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeRequest {
    pub principal: String,
    pub app: String,
    pub kind: UsageKind,
    /// Units to debit; 0 peeks without appending
    pub cost: u32,
    pub cap: u32,
    pub welcome_cap: Option<u32>,
    /// Start of the quota window
    pub since: DateTime<Utc>,
    /// Timestamp for the appended record
    pub at: DateTime<Utc>,
    /// Backends re-check this right before committing and roll back once
    /// it has passed, so a timed-out consume never debits
    pub deadline: Option<Deadline>,
}

impl ConsumeRequest {
    pub fn check_deadline(&self) -> Result<(), StoreError> {
        self.deadline.as_ref().map_or(Ok(()), Deadline::check)
    }

    /// Cap in force. The welcome cap applies only while the principal has
    /// no usage from before the current window.
    pub fn effective_cap(&self, has_prior_usage: bool) -> u32 {
        match self.welcome_cap {
            Some(welcome) if !has_prior_usage => welcome.max(self.cap),
            _ => self.cap,
        }
    }

    /// Decide against the usage observed inside the atomic section.
    ///
    /// Backends append a record of weight `cost` iff the outcome is accepted
    /// and `cost > 0`.
    pub fn settle(&self, used: u32, has_prior_usage: bool) -> ConsumeOutcome {
        let cap = self.effective_cap(has_prior_usage);
        let remaining = i64::from(cap) - i64::from(used);

        if remaining < i64::from(self.cost) {
            return ConsumeOutcome {
                accepted: false,
                balance_after: remaining.max(0) as u32,
                used,
                cap,
            };
        }

        ConsumeOutcome {
            accepted: true,
            balance_after: (remaining - i64::from(self.cost)) as u32,
            used: used + self.cost,
            cap,
        }
    }

    pub fn appends(&self, outcome: &ConsumeOutcome) -> bool {
        outcome.accepted && self.cost > 0
    }
}

/// Operations the core needs from the durable store
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn read_entitlement(
        &self,
        principal: &str,
        app: &str,
    ) -> Result<Option<Entitlement>, StoreError>;

    /// Create or update the single row for (principal, app)
    async fn upsert_entitlement(
        &self,
        principal: &str,
        app: &str,
        update: &EntitlementUpdate,
    ) -> Result<Entitlement, StoreError>;

    /// Sum of record weights of `kinds` with `created_at >= since`
    async fn sum_weighted_usage(
        &self,
        principal: &str,
        app: &str,
        kinds: &[UsageKind],
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Whether any record exists strictly before `before`
    async fn has_usage_before(
        &self,
        principal: &str,
        app: &str,
        before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn append_usage(
        &self,
        principal: &str,
        app: &str,
        kind: UsageKind,
        weight: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn supports_atomic_consume(&self) -> bool {
        false
    }

    /// Steps sum, compare and append as one transaction.
    ///
    /// The ledger does not cancel this call on timeout. Implementations
    /// must honour `request.deadline`: return [`StoreError::Timeout`]
    /// without appending once it has passed.
    async fn check_and_consume(
        &self,
        _request: &ConsumeRequest,
    ) -> Result<ConsumeOutcome, StoreError> {
        Err(StoreError::Unsupported("check_and_consume"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request(cost: u32, cap: u32, welcome_cap: Option<u32>) -> ConsumeRequest {
        let at = Utc.with_ymd_and_hms(2024, 3, 20, 3, 0, 0).unwrap();
        ConsumeRequest {
            principal: "u1".to_string(),
            app: "app".to_string(),
            kind: UsageKind::Generation,
            cost,
            cap,
            welcome_cap,
            since: at,
            at,
            deadline: None,
        }
    }

    #[test]
    fn test_settle_accepts_until_cap() {
        let req = request(1, 5, None);
        let outcome = req.settle(4, true);
        assert!(outcome.accepted);
        assert_eq!(outcome.balance_after, 0);
        assert_eq!(outcome.used, 5);

        let outcome = req.settle(5, true);
        assert!(!outcome.accepted);
        assert_eq!(outcome.balance_after, 0);
    }

    #[test]
    fn test_settle_weighted_cost_needs_full_balance() {
        let req = request(2, 5, None);
        let outcome = req.settle(4, true);
        assert!(!outcome.accepted);
        assert_eq!(outcome.balance_after, 1);
    }

    #[test]
    fn test_settle_over_cap_reports_zero() {
        // Cap lowered after usage was recorded
        let req = request(0, 3, None);
        let outcome = req.settle(7, true);
        assert!(!outcome.accepted);
        assert_eq!(outcome.balance_after, 0);
    }

    #[test]
    fn test_peek_never_appends() {
        let req = request(0, 5, None);
        let outcome = req.settle(2, true);
        assert!(outcome.accepted);
        assert_eq!(outcome.balance_after, 3);
        assert!(!req.appends(&outcome));
    }

    #[test]
    fn test_deadline_check() {
        let mut req = request(1, 5, None);
        assert!(req.check_deadline().is_ok());

        req.deadline = Some(Deadline::after(Duration::from_secs(60)));
        assert!(req.check_deadline().is_ok());

        req.deadline = Some(Deadline::after(Duration::ZERO));
        assert!(matches!(
            req.check_deadline(),
            Err(StoreError::Timeout(d)) if d == Duration::ZERO
        ));
    }

    #[test]
    fn test_welcome_cap_only_without_history() {
        let req = request(1, 5, Some(10));
        assert_eq!(req.effective_cap(false), 10);
        assert_eq!(req.effective_cap(true), 5);

        // A welcome cap below the steady cap never lowers it
        let req = request(1, 5, Some(2));
        assert_eq!(req.effective_cap(false), 5);
    }
}
