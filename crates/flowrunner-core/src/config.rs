//! Environment-driven configuration (§6, §10). Loaded once at process
//! start via [`Config::from_env`]; `.env` files are supported for local
//! development but nothing else — no configuration file format is
//! recognized beyond environment variables.

use std::time::Duration;

use crate::model::RetryPolicy;

/// Typed, defaulted configuration for the engine and worker pool.
///
/// Every field has a default matching §6's configuration table, so a
/// bare `Config::from_env()` with no environment variables set at all
/// produces a usable configuration for local development against the
/// in-memory store.
#[derive(Debug, Clone)]
pub struct Config {
    pub heartbeat_interval_ms: u64,
    pub worker_timeout_ms: u64,
    pub claim_lease_ms: u64,
    pub max_concurrent_steps: u32,
    pub default_run_timeout_s: u64,
    pub default_retry_policy: RetryPolicy,
    pub queue_claim_batch: u32,
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            worker_timeout_ms: 90_000,
            claim_lease_ms: 120_000,
            max_concurrent_steps: 5,
            default_run_timeout_s: 3_600,
            default_retry_policy: RetryPolicy::default(),
            queue_claim_batch: 10,
            database_url: None,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment, applying a
    /// `.env` file in the current directory first if one is present
    /// (ignored if absent — `.env` is a local-development convenience,
    /// never required in production).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let mut config = Config::default();

        if let Some(v) = env_u64("FLOWRUNNER_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_u64("FLOWRUNNER_WORKER_TIMEOUT_MS") {
            config.worker_timeout_ms = v;
        }
        if let Some(v) = env_u64("FLOWRUNNER_CLAIM_LEASE_MS") {
            config.claim_lease_ms = v;
        }
        if let Some(v) = env_u32("FLOWRUNNER_MAX_CONCURRENT_STEPS") {
            config.max_concurrent_steps = v;
        }
        if let Some(v) = env_u64("FLOWRUNNER_DEFAULT_RUN_TIMEOUT_S") {
            config.default_run_timeout_s = v;
        }
        if let Some(v) = env_u32("FLOWRUNNER_QUEUE_CLAIM_BATCH") {
            config.queue_claim_batch = v;
        }
        if let Some(v) = env_u32("FLOWRUNNER_RETRY_MAX_ATTEMPTS") {
            config.default_retry_policy.max_attempts = v;
        }
        if let Some(v) = env_u64("FLOWRUNNER_RETRY_BACKOFF_BASE_MS") {
            config.default_retry_policy.backoff_base_ms = v;
        }
        if let Some(v) = env_f64("FLOWRUNNER_RETRY_BACKOFF_FACTOR") {
            config.default_retry_policy.backoff_factor = v;
        }
        if let Some(v) = env_u64("FLOWRUNNER_RETRY_MAX_BACKOFF_MS") {
            config.default_retry_policy.max_backoff_ms = v;
        }
        config.database_url = std::env::var("DATABASE_URL").ok();

        config
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_configuration_table() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.worker_timeout_ms, 90_000);
        assert_eq!(config.claim_lease_ms, 120_000);
        assert_eq!(config.max_concurrent_steps, 5);
        assert_eq!(config.default_run_timeout_s, 3_600);
        assert_eq!(config.queue_claim_batch, 10);
        assert_eq!(config.default_retry_policy, RetryPolicy::default());
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("FLOWRUNNER_MAX_CONCURRENT_STEPS", "42");
        let config = Config::from_env();
        assert_eq!(config.max_concurrent_steps, 42);
        std::env::remove_var("FLOWRUNNER_MAX_CONCURRENT_STEPS");
    }
}
