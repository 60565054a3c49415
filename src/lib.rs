pub mod billing;
pub mod config;
pub mod rate_limit;

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub use billing::{AccessDecision, AccessGate, DenialReason, GateError};
pub use config::{ConfigError, GateConfig};

use billing::{SqliteStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open quota store: {0}")]
    Store(#[from] StoreError),
}

/// Install the global tracing subscriber.
///
/// Default: warn for most crates, info for this one.
/// Use RUST_LOG=debug for per-request consume logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,quota_gate=info")),
        )
        .try_init();
}

/// Build a gate from the environment: `.env`, config, SQLite store and the
/// process-wide rate limiter.
pub fn bootstrap() -> Result<AccessGate, InitError> {
    // Load .env file - current dir first, then the parent
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_path("../.env");
    }

    let config = GateConfig::from_env()?;
    let store = SqliteStore::open(&config.db_path)?;
    let limiter = rate_limit::install_global(config.limiter);

    tracing::info!(
        app = %config.app_id,
        db = %config.db_path.display(),
        rate_limit = config.rate_limit,
        "Quota gate ready"
    );
    Ok(AccessGate::new(&config, Arc::new(store), limiter))
}
