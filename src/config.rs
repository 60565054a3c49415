//! Gate configuration
//!
//! Read from the process environment (after `.env` is loaded). Every
//! variable is optional; a value that is present but malformed is an error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::billing::{PeriodKind, Plan, QuotaPolicy};
use crate::rate_limit::RateLimiterConfig;

pub const ENV_APP_ID: &str = "APP_ID";
pub const ENV_DB_PATH: &str = "QUOTA_GATE_DB";
pub const ENV_RATE_LIMIT: &str = "QUOTA_GATE_RATE_LIMIT";
pub const ENV_RATE_WINDOW_MS: &str = "QUOTA_GATE_RATE_WINDOW_MS";
pub const ENV_STORE_TIMEOUT_MS: &str = "QUOTA_GATE_STORE_TIMEOUT_MS";
pub const ENV_RATE_MAX_KEYS: &str = "QUOTA_GATE_RATE_MAX_KEYS";
pub const ENV_PLAN_POLICIES: &str = "QUOTA_GATE_PLAN_POLICIES";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("could not determine config directory; set {}", ENV_DB_PATH)]
    NoConfigDir,

    #[error("invalid QUOTA_GATE_PLAN_POLICIES: {0}")]
    Policies(#[from] serde_json::Error),
}

/// Allowance per plan. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPolicies(HashMap<Plan, Option<QuotaPolicy>>);

impl PlanPolicies {
    pub fn builtin(plan: Plan) -> Option<QuotaPolicy> {
        match plan {
            Plan::Free => Some(QuotaPolicy::new(5, PeriodKind::Weekly).with_welcome(10)),
            Plan::Trial => Some(QuotaPolicy::new(20, PeriodKind::Daily)),
            Plan::Entry => Some(QuotaPolicy::new(100, PeriodKind::Monthly)),
            Plan::Standard => Some(QuotaPolicy::new(300, PeriodKind::Monthly)),
            Plan::Professional | Plan::Pro => None,
        }
    }

    pub fn policy_for(&self, plan: Plan) -> Option<QuotaPolicy> {
        match self.0.get(&plan) {
            Some(policy) => *policy,
            None => Self::builtin(plan),
        }
    }

    pub fn set(&mut self, plan: Plan, policy: Option<QuotaPolicy>) {
        self.0.insert(plan, policy);
    }

    /// Merge a JSON object of `plan -> policy | null` over these policies
    pub fn merge_json(&mut self, json: &str) -> Result<(), ConfigError> {
        let overrides: HashMap<Plan, Option<QuotaPolicy>> = serde_json::from_str(json)?;
        self.0.extend(overrides);
        Ok(())
    }
}

impl Default for PlanPolicies {
    fn default() -> Self {
        Self(Plan::ALL.iter().map(|&p| (p, Self::builtin(p))).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub app_id: String,
    pub db_path: PathBuf,
    /// Admission limit per principal per `rate_window`
    pub rate_limit: usize,
    pub rate_window: Duration,
    pub store_timeout: Duration,
    pub policies: PlanPolicies,
    pub limiter: RateLimiterConfig,
}

impl GateConfig {
    /// Defaults with an explicit database path
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            app_id: "default".to_string(),
            db_path: db_path.into(),
            rate_limit: 20,
            rate_window: Duration::from_millis(60_000),
            store_timeout: Duration::from_millis(5_000),
            policies: PlanPolicies::default(),
            limiter: RateLimiterConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = match lookup(ENV_DB_PATH).filter(|v| !v.trim().is_empty()) {
            Some(path) => PathBuf::from(path),
            None => Self::default_db_path()?,
        };
        let mut config = Self::with_db_path(db_path);

        if let Some(app_id) = lookup(ENV_APP_ID).filter(|v| !v.trim().is_empty()) {
            config.app_id = app_id.trim().to_string();
        }
        if let Some(limit) = parse_var::<usize>(&lookup, ENV_RATE_LIMIT)? {
            config.rate_limit = limit;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_RATE_WINDOW_MS)? {
            config.rate_window = positive_millis(ENV_RATE_WINDOW_MS, ms)?;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_STORE_TIMEOUT_MS)? {
            config.store_timeout = positive_millis(ENV_STORE_TIMEOUT_MS, ms)?;
        }
        if let Some(max_keys) = parse_var::<usize>(&lookup, ENV_RATE_MAX_KEYS)? {
            config.limiter.max_keys = max_keys;
        }
        if let Some(json) = lookup(ENV_PLAN_POLICIES).filter(|v| !v.trim().is_empty()) {
            config.policies.merge_json(&json)?;
        }

        Ok(config)
    }

    fn default_db_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|d| d.join("quota-gate").join("quota.db"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    if value.trim().is_empty() {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: value.clone(),
            reason: e.to_string(),
        })
}

fn positive_millis(var: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: ms.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GateConfig::from_lookup(lookup_from(&[(ENV_DB_PATH, "/tmp/q.db")])).unwrap();
        assert_eq!(config.app_id, "default");
        assert_eq!(config.db_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.rate_limit, 20);
        assert_eq!(config.rate_window, Duration::from_secs(60));
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.limiter, RateLimiterConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = GateConfig::from_lookup(lookup_from(&[
            (ENV_DB_PATH, "/tmp/q.db"),
            (ENV_APP_ID, " studio "),
            (ENV_RATE_LIMIT, "3"),
            (ENV_RATE_WINDOW_MS, "1000"),
            (ENV_STORE_TIMEOUT_MS, "250"),
            (ENV_RATE_MAX_KEYS, "10"),
        ]))
        .unwrap();
        assert_eq!(config.app_id, "studio");
        assert_eq!(config.rate_limit, 3);
        assert_eq!(config.rate_window, Duration::from_millis(1000));
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.limiter.max_keys, 10);
    }

    #[test]
    fn test_malformed_values_are_errors() {
        let err = GateConfig::from_lookup(lookup_from(&[
            (ENV_DB_PATH, "/tmp/q.db"),
            (ENV_RATE_LIMIT, "twenty"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_RATE_LIMIT, .. }));

        let err = GateConfig::from_lookup(lookup_from(&[
            (ENV_DB_PATH, "/tmp/q.db"),
            (ENV_STORE_TIMEOUT_MS, "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_STORE_TIMEOUT_MS, .. }));

        let err = GateConfig::from_lookup(lookup_from(&[
            (ENV_DB_PATH, "/tmp/q.db"),
            (ENV_PLAN_POLICIES, "{not json"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Policies(_)));
        assert!(err.to_string().starts_with("invalid QUOTA_GATE_PLAN_POLICIES: "));
    }

    #[test]
    fn test_builtin_policy_table() {
        let policies = PlanPolicies::default();
        let free = policies.policy_for(Plan::Free).unwrap();
        assert_eq!(free.cap, 5);
        assert_eq!(free.period, PeriodKind::Weekly);
        assert_eq!(free.welcome_cap, Some(10));
        assert_eq!(policies.policy_for(Plan::Trial).unwrap().period, PeriodKind::Daily);
        assert_eq!(policies.policy_for(Plan::Standard).unwrap().cap, 300);
        assert!(policies.policy_for(Plan::Professional).is_none());
        assert!(policies.policy_for(Plan::Pro).is_none());
    }

    #[test]
    fn test_policy_overrides_merge() {
        let config = GateConfig::from_lookup(lookup_from(&[
            (ENV_DB_PATH, "/tmp/q.db"),
            (
                ENV_PLAN_POLICIES,
                r#"{"entry": {"cap": 50, "period": "weekly"}, "standard": null}"#,
            ),
        ]))
        .unwrap();

        let entry = config.policies.policy_for(Plan::Entry).unwrap();
        assert_eq!(entry, QuotaPolicy::new(50, PeriodKind::Weekly));
        assert!(config.policies.policy_for(Plan::Standard).is_none());
        // Untouched plans keep the built-in allowance
        assert_eq!(config.policies.policy_for(Plan::Free).unwrap().cap, 5);
    }
}
