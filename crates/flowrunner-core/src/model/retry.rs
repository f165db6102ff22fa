//! Retry policy for runs and queue items
//!
//! Distinct from [`crate::reliability::RetryPolicy`], which is a general
//! purpose utility for protecting calls to external services: this is
//! the domain-level policy attached to a [`crate::model::WorkflowRun`]
//! and consulted by the Work Queue when a step fails, using the exact
//! field names and backoff formula called for by the queue's backoff
//! contract.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// `{max_attempts, backoff_base_ms, backoff_factor, max_backoff_ms}`
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_factor: 2.0,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// `available_at = now() + min(backoff_base_ms * factor^attempt + rand[0, base], max_backoff_ms)`
    pub fn backoff_millis_for_attempt(&self, attempt: u32) -> u64 {
        let exp = self.backoff_factor.powi(attempt as i32);
        let base = self.backoff_base_ms as f64 * exp;
        let jitter = rand::thread_rng().gen_range(0.0..=(self.backoff_base_ms as f64));
        let total = (base + jitter).min(self.max_backoff_ms as f64);
        total.max(0.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_base_ms: 1000,
            backoff_factor: 2.0,
            max_backoff_ms: 5000,
        };
        assert!(policy.backoff_millis_for_attempt(0) >= policy.backoff_base_ms);
        let capped = policy.backoff_millis_for_attempt(10);
        assert!(capped <= policy.max_backoff_ms);
    }

    #[test]
    fn attempts_remaining_respects_max() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }
}
