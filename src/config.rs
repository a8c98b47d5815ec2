//! `ServiceConfig` (§6 "Service construction"): the single normative
//! config surface, loaded from environment variables via `dotenvy` then
//! falling back to struct-literal defaults, mirroring `weavegraph`'s
//! `RuntimeConfig::resolve_sqlite_db_name` dotenvy-then-env-then-default
//! pattern.

use std::path::PathBuf;
use std::time::Duration;

use crate::audit::OverflowPolicy;
use crate::errors::DecisionError;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub worker_pool_size: usize,
    pub audit_queue_capacity: usize,
    pub audit_queue_timeout: Duration,
    pub audit_log_dir: PathBuf,
    pub policy_config_path: Option<PathBuf>,
    pub behavior_min_sessions: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: crate::router::default_pool_size(),
            audit_queue_capacity: 1000,
            audit_queue_timeout: Duration::from_millis(50),
            audit_log_dir: PathBuf::from("./audit-log"),
            policy_config_path: None,
            behavior_min_sessions: 5,
            overflow_policy: OverflowPolicy::SyncFallback,
        }
    }
}

impl ServiceConfig {
    /// Loads `.env` (if present), then reads each `DECISION_*`/`AUDIT_*`
    /// environment variable, falling back to the struct default when the
    /// variable is absent. Malformed values surface as `CONFIG_ERROR`.
    pub fn from_env() -> Result<Self, DecisionError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let worker_pool_size = env_parsed("DECISION_WORKER_POOL_SIZE", defaults.worker_pool_size)?;
        let audit_queue_capacity = env_parsed("AUDIT_QUEUE_CAPACITY", defaults.audit_queue_capacity)?;
        let audit_queue_timeout_ms = env_parsed("AUDIT_QUEUE_TIMEOUT_MS", defaults.audit_queue_timeout.as_millis() as u64)?;
        let audit_log_dir = std::env::var("AUDIT_LOG_DIR").map(PathBuf::from).unwrap_or(defaults.audit_log_dir);
        let policy_config_path = std::env::var("POLICY_CONFIG_PATH").ok().map(PathBuf::from);
        let behavior_min_sessions = env_parsed("BEHAVIOR_MIN_SESSIONS", defaults.behavior_min_sessions)?;

        Ok(Self {
            worker_pool_size,
            audit_queue_capacity,
            audit_queue_timeout: Duration::from_millis(audit_queue_timeout_ms),
            audit_log_dir,
            policy_config_path,
            behavior_min_sessions,
            overflow_policy: defaults.overflow_policy,
        })
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T, DecisionError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| DecisionError::Config(format!("{key} is not a valid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_self_consistent() {
        let config = ServiceConfig::default();
        assert!(config.worker_pool_size >= 1);
        assert_eq!(config.behavior_min_sessions, 5);
    }

    #[test]
    fn malformed_env_var_is_a_config_error() {
        // SAFETY: test-only, single-threaded env mutation scoped to this test.
        unsafe {
            std::env::set_var("DECISION_WORKER_POOL_SIZE", "not-a-number");
        }
        let result = ServiceConfig::from_env();
        unsafe {
            std::env::remove_var("DECISION_WORKER_POOL_SIZE");
        }
        assert!(result.is_err());
    }
}
