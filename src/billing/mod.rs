//! Billing module for entitlement checks and quota accounting
//!
//! This module handles:
//! - Plan/status/expiry evaluation per (principal, app)
//! - Civil-calendar quota windows in a fixed UTC+9 offset
//! - Atomic check-and-consume against the durable store
//! - The access gate that composes them with the admission limiter

mod entitlement;
mod error;
mod gate;
mod ledger;
pub mod store;
mod types;
mod window;


pub use entitlement::CapabilityTier;
pub use error::{retry_after_secs, DenialReason, GateError};
pub use gate::{AccessDecision, AccessGate, Grant, PlanSnapshot};
pub use ledger::QuotaLedger;
pub use store::{ConsumeRequest, Deadline, MemoryStore, QuotaStore, SqliteStore, StoreError};
pub use types::{
    ConsumeOutcome, Entitlement, EntitlementStatus, EntitlementUpdate, PeriodKind, Plan,
    QuotaPolicy, UsageKind, UsageRecord,
};
pub use window::{
    civil_bounds, civil_day_start, civil_month_start, civil_timezone, civil_week_start,
    CivilBounds, QuotaWindow, CIVIL_OFFSET_HOURS,
};
