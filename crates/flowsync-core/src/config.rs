//! Centralized configuration knobs (spec.md §6).
//!
//! Every field has the documented default. `EngineConfig::from_env` loads
//! overrides from `FLOWSYNC_*` environment variables (via `dotenvy`), the way
//! the reference engine loads its settings from a `.env` file with typed
//! fallbacks.

use std::time::Duration;

use crate::backpressure::BackpressureConfig;
use crate::reliability::RetryPolicy;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub backpressure: BackpressureConfig,
    pub idempotency_ttl: Duration,
    pub heartbeat_stall_threshold: Duration,
    pub orchestrator_timeout: Duration,
    pub max_delay: Duration,
    pub scheduler_tick: Duration,
    pub default_retry_policy: RetryPolicy,
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poll_interval: Duration::from_millis(500),
            backpressure: BackpressureConfig::default(),
            idempotency_ttl: Duration::from_millis(300_000),
            heartbeat_stall_threshold: Duration::from_millis(30_000),
            orchestrator_timeout: Duration::from_millis(300_000),
            max_delay: Duration::from_millis(300_000),
            scheduler_tick: Duration::from_millis(60_000),
            default_retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Load overrides from the environment (`.env` is loaded if present).
    ///
    /// Unset variables fall back to the documented defaults; malformed
    /// values are logged and ignored rather than treated as fatal, since
    /// this is optional operator tuning, not required configuration.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Some(v) = env_usize("FLOWSYNC_MAX_CONCURRENCY") {
            config.max_concurrency = v.max(1);
        }
        if let Some(v) = env_millis("FLOWSYNC_POLL_INTERVAL_MS") {
            config.poll_interval = v;
        }
        if let Some(v) = env_usize("FLOWSYNC_BACKPRESSURE_LOW_WATER") {
            config.backpressure.low_water = v;
        }
        if let Some(v) = env_usize("FLOWSYNC_BACKPRESSURE_HIGH_WATER") {
            config.backpressure.high_water = v;
        }
        if let Some(v) = env_usize("FLOWSYNC_BACKPRESSURE_MAX_DEPTH") {
            config.backpressure.max_depth = v;
        }
        if let Some(v) = env_millis("FLOWSYNC_IDEMPOTENCY_TTL_MS") {
            config.idempotency_ttl = v;
        }
        if let Some(v) = env_millis("FLOWSYNC_HEARTBEAT_STALL_MS") {
            config.heartbeat_stall_threshold = v;
        }
        if let Some(v) = env_millis("FLOWSYNC_ORCHESTRATOR_TIMEOUT_MS") {
            config.orchestrator_timeout = v;
        }
        if let Some(v) = env_millis("FLOWSYNC_MAX_DELAY_MS") {
            config.max_delay = v;
        }
        if let Some(v) = env_millis("FLOWSYNC_SCHEDULER_TICK_MS") {
            config.scheduler_tick = v;
        }

        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| match v.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %v, "ignoring malformed environment override");
            None
        }
    })
}

fn env_millis(key: &str) -> Option<Duration> {
    env_usize(key).map(|n| Duration::from_millis(n as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 5);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.backpressure.low_water, 200);
        assert_eq!(config.backpressure.high_water, 800);
        assert_eq!(config.backpressure.max_depth, 1000);
        assert_eq!(config.idempotency_ttl, Duration::from_secs(300));
        assert_eq!(config.heartbeat_stall_threshold, Duration::from_secs(30));
        assert_eq!(config.orchestrator_timeout, Duration::from_secs(300));
        assert_eq!(config.max_delay, Duration::from_secs(300));
        assert_eq!(config.scheduler_tick, Duration::from_secs(60));
        assert_eq!(config.default_retry_policy.max_retries, 0);
    }
}
