//! In-process store
//!
//! Everything lives behind one mutex, which makes `check_and_consume`
//! atomic. Used by tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::{ConsumeRequest, QuotaStore, StoreError};
use crate::billing::types::{
    ConsumeOutcome, Entitlement, EntitlementUpdate, UsageKind, UsageRecord,
};

#[derive(Default)]
struct MemoryState {
    entitlements: HashMap<(String, String), Entitlement>,
    usage: Vec<UsageRecord>,
}

impl MemoryState {
    fn sum(&self, principal: &str, app: &str, kinds: &[UsageKind], since: DateTime<Utc>) -> u32 {
        self.usage
            .iter()
            .filter(|r| r.principal == principal && r.app == app)
            .filter(|r| kinds.contains(&r.kind) && r.created_at >= since)
            .map(|r| r.weight)
            .sum()
    }

    fn has_before(&self, principal: &str, app: &str, before: DateTime<Utc>) -> bool {
        self.usage
            .iter()
            .any(|r| r.principal == principal && r.app == app && r.created_at < before)
    }
}

/// Store kept entirely in memory
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    atomic_consume: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            atomic_consume: true,
        }
    }

    /// Store that exposes only the primitive operations, like an eventually
    /// consistent backend. The ledger has to serialize consumes itself.
    pub fn primitives_only() -> Self {
        Self {
            atomic_consume: false,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("MemoryStore mutex was poisoned, recovering inner value");
            poisoned.into_inner()
        })
    }

    /// Usage log for one principal, oldest first
    pub fn records(&self, principal: &str, app: &str) -> Vec<UsageRecord> {
        let state = self.lock();
        let mut records: Vec<UsageRecord> = state
            .usage
            .iter()
            .filter(|r| r.principal == principal && r.app == app)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn read_entitlement(
        &self,
        principal: &str,
        app: &str,
    ) -> Result<Option<Entitlement>, StoreError> {
        let state = self.lock();
        Ok(state
            .entitlements
            .get(&(principal.to_string(), app.to_string()))
            .cloned())
    }

    async fn upsert_entitlement(
        &self,
        principal: &str,
        app: &str,
        update: &EntitlementUpdate,
    ) -> Result<Entitlement, StoreError> {
        let now = Utc::now();
        let mut state = self.lock();
        let row = state
            .entitlements
            .entry((principal.to_string(), app.to_string()))
            .or_insert_with(|| Entitlement::new_default(principal, app, now));
        update.apply(row, now);
        Ok(row.clone())
    }

    async fn sum_weighted_usage(
        &self,
        principal: &str,
        app: &str,
        kinds: &[UsageKind],
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        Ok(self.lock().sum(principal, app, kinds, since))
    }

    async fn has_usage_before(
        &self,
        principal: &str,
        app: &str,
        before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.lock().has_before(principal, app, before))
    }

    async fn append_usage(
        &self,
        principal: &str,
        app: &str,
        kind: UsageKind,
        weight: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock()
            .usage
            .push(UsageRecord::new(principal, app, kind, weight, at));
        Ok(())
    }

    fn supports_atomic_consume(&self) -> bool {
        self.atomic_consume
    }

    async fn check_and_consume(
        &self,
        request: &ConsumeRequest,
    ) -> Result<ConsumeOutcome, StoreError> {
        if !self.atomic_consume {
            return Err(StoreError::Unsupported("check_and_consume"));
        }

        let mut state = self.lock();
        request.check_deadline()?;
        let used = state.sum(
            &request.principal,
            &request.app,
            &UsageKind::METERED,
            request.since,
        );
        let has_prior = request.welcome_cap.is_none()
            || state.has_before(&request.principal, &request.app, request.since);

        let outcome = request.settle(used, has_prior);
        if request.appends(&outcome) {
            state.usage.push(UsageRecord::new(
                &request.principal,
                &request.app,
                request.kind,
                request.cost,
                request.at,
            ));
        }

        debug!(
            user = %request.principal,
            accepted = outcome.accepted,
            balance = outcome.balance_after,
            "Memory check_and_consume"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::store::Deadline;
    use chrono::{Duration, TimeZone};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_weighted_sum() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .append_usage("u1", "app", UsageKind::Generation, 1, at(2))
                .await
                .unwrap();
        }
        store
            .append_usage("u1", "app", UsageKind::MultiStepGeneration, 2, at(3))
            .await
            .unwrap();
        // Auxiliary kinds and other principals are not counted
        store
            .append_usage("u1", "app", UsageKind::Analysis, 1, at(3))
            .await
            .unwrap();
        store
            .append_usage("u2", "app", UsageKind::Generation, 1, at(3))
            .await
            .unwrap();

        let used = store
            .sum_weighted_usage("u1", "app", &UsageKind::METERED, at(0))
            .await
            .unwrap();
        assert_eq!(used, 5);

        let used = store
            .sum_weighted_usage("u1", "app", &UsageKind::METERED, at(3))
            .await
            .unwrap();
        assert_eq!(used, 2);
    }

    #[tokio::test]
    async fn test_has_usage_before_is_strict() {
        let store = MemoryStore::new();
        store
            .append_usage("u1", "app", UsageKind::Refine, 1, at(5))
            .await
            .unwrap();
        assert!(!store.has_usage_before("u1", "app", at(5)).await.unwrap());
        assert!(store
            .has_usage_before("u1", "app", at(5) + Duration::seconds(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_per_principal_and_app() {
        let store = MemoryStore::new();
        assert!(store.read_entitlement("u1", "app").await.unwrap().is_none());

        let update = EntitlementUpdate::default().plan(crate::billing::types::Plan::Entry);
        store.upsert_entitlement("u1", "app", &update).await.unwrap();
        store.upsert_entitlement("u1", "app", &update).await.unwrap();
        store
            .upsert_entitlement("u1", "other", &EntitlementUpdate::default())
            .await
            .unwrap();

        let row = store.read_entitlement("u1", "app").await.unwrap().unwrap();
        assert_eq!(row.plan, crate::billing::types::Plan::Entry);
        let other = store.read_entitlement("u1", "other").await.unwrap().unwrap();
        assert_eq!(other.plan, crate::billing::types::Plan::Free);
    }

    #[tokio::test]
    async fn test_expired_deadline_appends_nothing() {
        let store = MemoryStore::new();
        let request = ConsumeRequest {
            principal: "u1".to_string(),
            app: "app".to_string(),
            kind: UsageKind::Generation,
            cost: 1,
            cap: 5,
            welcome_cap: None,
            since: at(0),
            at: at(1),
            deadline: Some(Deadline::after(std::time::Duration::ZERO)),
        };
        assert!(matches!(
            store.check_and_consume(&request).await,
            Err(StoreError::Timeout(_))
        ));
        assert!(store.records("u1", "app").is_empty());
    }

    #[tokio::test]
    async fn test_primitives_only_rejects_atomic_call() {
        let store = MemoryStore::primitives_only();
        assert!(!store.supports_atomic_consume());
        let request = ConsumeRequest {
            principal: "u1".to_string(),
            app: "app".to_string(),
            kind: UsageKind::Generation,
            cost: 1,
            cap: 1,
            welcome_cap: None,
            since: at(0),
            at: at(1),
            deadline: None,
        };
        assert!(matches!(
            store.check_and_consume(&request).await,
            Err(StoreError::Unsupported(_))
        ));
    }
}
