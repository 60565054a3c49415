//! SQLite-backed store
//!
//! Entitlements and the append-only usage log live in one database file.
//! `check_and_consume` runs inside a `BEGIN IMMEDIATE` transaction, which
//! takes the write lock before the sum is read, so two consumers can never
//! both see the last unit as free.
//!
//! Timestamps are stored as Unix milliseconds (UTC).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ConsumeRequest, QuotaStore, StoreError};
use crate::billing::types::{
    ConsumeOutcome, Entitlement, EntitlementStatus, EntitlementUpdate, Plan, UsageKind,
};

/// How long SQLite waits on a lock held by another connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS entitlements (
        principal TEXT NOT NULL,
        app TEXT NOT NULL,
        plan TEXT NOT NULL DEFAULT 'free',
        status TEXT NOT NULL DEFAULT 'active',
        expires_at INTEGER,
        trial_ends_at INTEGER,
        current_period_start INTEGER,
        billing_reference_id TEXT,
        billing_customer_id TEXT,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (principal, app)
    );

    CREATE TABLE IF NOT EXISTS usage_records (
        id TEXT PRIMARY KEY,
        principal TEXT NOT NULL,
        app TEXT NOT NULL,
        kind TEXT NOT NULL,
        weight INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_usage_principal_time
        ON usage_records(principal, app, created_at);
"#;

/// SQLite-backed quota store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create database dir: {}", e))
            })?;
        }

        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = acquire_conn(&conn);
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

/// Lock the connection, recovering from a poisoned mutex
fn acquire_conn(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned: PoisonError<MutexGuard<'_, Connection>>| {
        warn!("SQLite connection mutex was poisoned, recovering inner value");
        poisoned.into_inner()
    })
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {}", ms)))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

/// Raw column values, converted outside the rusqlite row closure
struct EntitlementRow {
    principal: String,
    app: String,
    plan: String,
    status: String,
    expires_at: Option<i64>,
    trial_ends_at: Option<i64>,
    current_period_start: Option<i64>,
    billing_reference_id: Option<String>,
    billing_customer_id: Option<String>,
    updated_at: i64,
}

impl EntitlementRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            principal: row.get(0)?,
            app: row.get(1)?,
            plan: row.get(2)?,
            status: row.get(3)?,
            expires_at: row.get(4)?,
            trial_ends_at: row.get(5)?,
            current_period_start: row.get(6)?,
            billing_reference_id: row.get(7)?,
            billing_customer_id: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_entitlement(self) -> Result<Entitlement, StoreError> {
        Ok(Entitlement {
            principal: self.principal,
            app: self.app,
            plan: Plan::from_db(&self.plan),
            status: EntitlementStatus::from_db(&self.status),
            expires_at: opt_from_millis(self.expires_at)?,
            trial_ends_at: opt_from_millis(self.trial_ends_at)?,
            current_period_start: opt_from_millis(self.current_period_start)?,
            billing_reference_id: self.billing_reference_id,
            billing_customer_id: self.billing_customer_id,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

fn select_entitlement(
    conn: &Connection,
    principal: &str,
    app: &str,
) -> Result<Option<Entitlement>, StoreError> {
    let row = conn
        .query_row(
            "SELECT principal, app, plan, status, expires_at, trial_ends_at,
                    current_period_start, billing_reference_id, billing_customer_id, updated_at
             FROM entitlements WHERE principal = ?1 AND app = ?2",
            params![principal, app],
            EntitlementRow::from_row,
        )
        .optional()?;

    row.map(EntitlementRow::into_entitlement).transpose()
}

fn write_entitlement(conn: &Connection, ent: &Entitlement) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO entitlements (principal, app, plan, status, expires_at, trial_ends_at,
                                  current_period_start, billing_reference_id,
                                  billing_customer_id, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(principal, app) DO UPDATE SET
            plan = excluded.plan,
            status = excluded.status,
            expires_at = excluded.expires_at,
            trial_ends_at = excluded.trial_ends_at,
            current_period_start = excluded.current_period_start,
            billing_reference_id = excluded.billing_reference_id,
            billing_customer_id = excluded.billing_customer_id,
            updated_at = excluded.updated_at
        "#,
        params![
            ent.principal,
            ent.app,
            ent.plan.as_str(),
            ent.status.as_str(),
            ent.expires_at.map(to_millis),
            ent.trial_ends_at.map(to_millis),
            ent.current_period_start.map(to_millis),
            ent.billing_reference_id,
            ent.billing_customer_id,
            to_millis(ent.updated_at),
        ],
    )?;
    Ok(())
}

fn sum_usage(
    conn: &Connection,
    principal: &str,
    app: &str,
    kinds: &[UsageKind],
    since: DateTime<Utc>,
) -> Result<u32, StoreError> {
    if kinds.is_empty() {
        return Ok(0);
    }

    let placeholders = vec!["?"; kinds.len()].join(", ");
    let sql = format!(
        "SELECT COALESCE(SUM(weight), 0) FROM usage_records
         WHERE principal = ? AND app = ? AND created_at >= ? AND kind IN ({})",
        placeholders
    );

    let mut values = vec![
        Value::Text(principal.to_string()),
        Value::Text(app.to_string()),
        Value::Integer(to_millis(since)),
    ];
    values.extend(kinds.iter().map(|k| Value::Text(k.as_str().to_string())));

    let total: i64 = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
    u32::try_from(total).map_err(|_| StoreError::Corrupt(format!("usage sum out of range: {}", total)))
}

fn usage_before(
    conn: &Connection,
    principal: &str,
    app: &str,
    before: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM usage_records WHERE principal = ?1 AND app = ?2 AND created_at < ?3 LIMIT 1",
            params![principal, app, to_millis(before)],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn insert_usage(
    conn: &Connection,
    principal: &str,
    app: &str,
    kind: UsageKind,
    weight: u32,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO usage_records (id, principal, app, kind, weight, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            Uuid::new_v4().to_string(),
            principal,
            app,
            kind.as_str(),
            weight,
            to_millis(at)
        ],
    )?;
    Ok(())
}

#[async_trait]
impl QuotaStore for SqliteStore {
    async fn read_entitlement(
        &self,
        principal: &str,
        app: &str,
    ) -> Result<Option<Entitlement>, StoreError> {
        let (principal, app) = (principal.to_string(), app.to_string());
        self.with_conn(move |conn| select_entitlement(conn, &principal, &app))
            .await
    }

    async fn upsert_entitlement(
        &self,
        principal: &str,
        app: &str,
        update: &EntitlementUpdate,
    ) -> Result<Entitlement, StoreError> {
        let (principal, app, update) = (principal.to_string(), app.to_string(), update.clone());
        self.with_conn(move |conn| {
            let now = Utc::now();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut ent = select_entitlement(&tx, &principal, &app)?
                .unwrap_or_else(|| Entitlement::new_default(&principal, &app, now));
            update.apply(&mut ent, now);
            write_entitlement(&tx, &ent)?;
            tx.commit()?;

            debug!(user = %principal, plan = %ent.plan, status = %ent.status, "Upserted entitlement");
            Ok(ent)
        })
        .await
    }

    async fn sum_weighted_usage(
        &self,
        principal: &str,
        app: &str,
        kinds: &[UsageKind],
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let (principal, app, kinds) = (principal.to_string(), app.to_string(), kinds.to_vec());
        self.with_conn(move |conn| sum_usage(conn, &principal, &app, &kinds, since))
            .await
    }

    async fn has_usage_before(
        &self,
        principal: &str,
        app: &str,
        before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (principal, app) = (principal.to_string(), app.to_string());
        self.with_conn(move |conn| usage_before(conn, &principal, &app, before))
            .await
    }

    async fn append_usage(
        &self,
        principal: &str,
        app: &str,
        kind: UsageKind,
        weight: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (principal, app) = (principal.to_string(), app.to_string());
        self.with_conn(move |conn| insert_usage(conn, &principal, &app, kind, weight, at))
            .await
    }

    fn supports_atomic_consume(&self) -> bool {
        true
    }

    async fn check_and_consume(
        &self,
        request: &ConsumeRequest,
    ) -> Result<ConsumeOutcome, StoreError> {
        let request = request.clone();
        self.with_conn(move |conn| {
            // Queued behind the connection lock or the blocking pool
            request.check_deadline()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let used = sum_usage(
                &tx,
                &request.principal,
                &request.app,
                &UsageKind::METERED,
                request.since,
            )?;
            let has_prior = match request.welcome_cap {
                Some(_) => usage_before(&tx, &request.principal, &request.app, request.since)?,
                None => true,
            };

            let outcome = request.settle(used, has_prior);
            if request.appends(&outcome) {
                insert_usage(
                    &tx,
                    &request.principal,
                    &request.app,
                    request.kind,
                    request.cost,
                    request.at,
                )?;
            }
            // Dropping `tx` on this early return rolls the append back
            request.check_deadline()?;
            tx.commit()?;

            debug!(
                user = %request.principal,
                kind = %request.kind,
                accepted = outcome.accepted,
                balance = outcome.balance_after,
                "SQLite check_and_consume"
            );
            Ok(outcome)
        })
        .await
    }
}
