//! Quota ledger
//!
//! Computes a principal's weighted consumption for the active window and
//! applies debits against a cap, atomically per (principal, app).
//!
//! ## Concurrency Safety
//! Backends with a server-side transaction get one `check_and_consume`
//! call. For backends that only expose the primitives, sum + append run
//! under a per-key async mutex held for the whole read-modify-write.
//!
//! Every store round trip is bounded by `store_timeout`; a timeout is
//! reported as [`StoreError::Timeout`], never as a grant or a denial.
//! A consume carries a [`Deadline`] instead of being cancelled from the
//! outside: the backend checks it before committing, and an append that was
//! already issued is awaited to completion. A consume that reports
//! `Timeout` has therefore never debited.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error};

use super::store::{ConsumeRequest, Deadline, QuotaStore, StoreError};
use super::types::{ConsumeOutcome, Entitlement, EntitlementUpdate, QuotaPolicy, UsageKind};
use super::window::QuotaWindow;

type LedgerKey = (String, String);

pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    store_timeout: Duration,
    /// Per-(principal, app) locks for stores without atomic consume
    key_locks: DashMap<LedgerKey, Arc<AsyncMutex<()>>>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
            key_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    /// Bound a store call by the configured timeout
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let result = match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        };
        if let Err(e) = &result {
            error!(op, error = %e, "Quota store call failed");
        }
        result
    }

    /// Read the entitlement row, creating the default one on first sight
    pub async fn entitlement_or_default(
        &self,
        principal: &str,
        app: &str,
    ) -> Result<Entitlement, StoreError> {
        if let Some(ent) = self
            .bounded("read_entitlement", self.store.read_entitlement(principal, app))
            .await?
        {
            return Ok(ent);
        }

        debug!(user = principal, app, "Creating default entitlement");
        // An empty update on a missing row writes the defaults; on a row a
        // webhook created concurrently it only touches updated_at.
        self.update_entitlement(principal, app, &EntitlementUpdate::default())
            .await
    }

    /// Entitlement write on behalf of a billing collaborator
    pub async fn update_entitlement(
        &self,
        principal: &str,
        app: &str,
        update: &EntitlementUpdate,
    ) -> Result<Entitlement, StoreError> {
        self.bounded(
            "upsert_entitlement",
            self.store.upsert_entitlement(principal, app, update),
        )
        .await
    }

    /// Check the cap and debit `cost` units at the current time
    pub async fn consume(
        &self,
        principal: &str,
        app: &str,
        kind: UsageKind,
        cost: u32,
        policy: &QuotaPolicy,
        anchor: Option<DateTime<Utc>>,
    ) -> Result<ConsumeOutcome, StoreError> {
        self.consume_at(principal, app, kind, cost, policy, anchor, Utc::now())
            .await
    }

    /// Check the cap and debit `cost` units as of `now`.
    ///
    /// `cost == 0` is a peek: the window is resolved exactly as for a debit
    /// but nothing is appended.
    #[allow(clippy::too_many_arguments)]
    pub async fn consume_at(
        &self,
        principal: &str,
        app: &str,
        kind: UsageKind,
        cost: u32,
        policy: &QuotaPolicy,
        anchor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError> {
        let window = QuotaWindow::resolve(policy.period, now, anchor);
        let request = ConsumeRequest {
            principal: principal.to_string(),
            app: app.to_string(),
            kind,
            cost,
            cap: policy.cap,
            welcome_cap: policy.welcome_cap,
            since: window.start,
            at: now,
            deadline: Some(Deadline::after(self.store_timeout)),
        };

        let result = if self.store.supports_atomic_consume() {
            self.store.check_and_consume(&request).await
        } else {
            self.consume_serialized(&request).await
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(op = "check_and_consume", error = %e, "Quota store call failed");
                return Err(e);
            }
        };

        debug!(
            user = principal,
            app,
            kind = %kind,
            cost,
            accepted = outcome.accepted,
            balance = outcome.balance_after,
            since = %window.start,
            "Quota consume"
        );
        Ok(outcome)
    }

    /// Remaining balance without charging
    pub async fn peek_at(
        &self,
        principal: &str,
        app: &str,
        policy: &QuotaPolicy,
        anchor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ConsumeOutcome, StoreError> {
        self.consume_at(principal, app, UsageKind::Generation, 0, policy, anchor, now)
            .await
    }

    /// Append an uncapped record (auxiliary kinds, unlimited plans)
    pub async fn record_at(
        &self,
        principal: &str,
        app: &str,
        kind: UsageKind,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.bounded(
            "append_usage",
            self.store
                .append_usage(principal, app, kind, kind.weight(), now),
        )
        .await
    }

    /// Read-modify-write under the per-key lock.
    ///
    /// Waiting for the lock and the reads give up at the deadline; the
    /// append is only issued while time remains and is never abandoned.
    async fn consume_serialized(
        &self,
        request: &ConsumeRequest,
    ) -> Result<ConsumeOutcome, StoreError> {
        let deadline = request
            .deadline
            .unwrap_or_else(|| Deadline::after(self.store_timeout));
        let key = (request.principal.clone(), request.app.clone());
        let lock = Arc::clone(
            self.key_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .value(),
        );

        let result = async {
            let read = async {
                let guard = lock.lock().await;
                let used = self
                    .store
                    .sum_weighted_usage(
                        &request.principal,
                        &request.app,
                        &UsageKind::METERED,
                        request.since,
                    )
                    .await?;
                let has_prior = match request.welcome_cap {
                    Some(_) => {
                        self.store
                            .has_usage_before(&request.principal, &request.app, request.since)
                            .await?
                    }
                    None => true,
                };
                Ok::<_, StoreError>((guard, used, has_prior))
            };
            let (_guard, used, has_prior) = tokio::time::timeout(deadline.remaining(), read)
                .await
                .map_err(|_| deadline.timeout_error())??;

            let outcome = request.settle(used, has_prior);
            if request.appends(&outcome) {
                deadline.check()?;
                self.store
                    .append_usage(
                        &request.principal,
                        &request.app,
                        request.kind,
                        request.cost,
                        request.at,
                    )
                    .await?;
            }
            Ok::<_, StoreError>(outcome)
        }
        .await;

        drop(lock);
        // Forget the lock once nobody else holds or waits on it
        self.key_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.key_locks.len()
    }
}
