//! Retry policy for step execution

use serde::{Deserialize, Serialize};

/// Per-node retry configuration (`node.config.retry`)
///
/// `max_retries` is the number of retries *beyond* the initial attempt, so a
/// node runs at most `max_retries + 1` times total.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying `attempt` (1-based, the attempt that just failed).
    ///
    /// `delay = backoff_ms * backoff_multiplier ^ (attempt - 1)`
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        std::time::Duration::from_millis(millis.round() as u64)
    }

    /// Whether another attempt is allowed after `attempt` has failed.
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_retries + 1
    }
}
