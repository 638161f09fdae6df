//! TTL-bounded idempotency store, keyed `"executionId:nodeId"` (spec.md §4.3).

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub duplicate: bool,
    pub existing_step_id: Option<Uuid>,
}

struct Entry {
    step_id: Uuid,
    expires_at: DateTime<Utc>,
}

/// Deduplicates node publication within a TTL window.
///
/// Entries are cleared explicitly by [`Self::remove`] (the Consumer does
/// this before re-enqueueing a retry) or by the background sweep once they
/// expire — whichever comes first.
pub struct IdempotencyStore {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn key(execution_id: Uuid, node_id: &str) -> String {
        format!("{execution_id}:{node_id}")
    }

    /// First sight of `key` stores `(step_id, now + ttl)` and returns
    /// `duplicate: false`. A live (non-expired) existing entry returns
    /// `duplicate: true` with the id recorded by the first caller.
    pub fn check_and_set(&self, key: &str, step_id: Uuid) -> CheckResult {
        let now = Utc::now();

        if let Some(existing) = self.entries.get(key) {
            if existing.expires_at > now {
                return CheckResult {
                    duplicate: true,
                    existing_step_id: Some(existing.step_id),
                };
            }
        }

        self.entries.insert(
            key.to_string(),
            Entry {
                step_id,
                expires_at: now + self.ttl_as_chrono(),
            },
        );
        CheckResult {
            duplicate: false,
            existing_step_id: None,
        }
    }

    /// Allows a subsequent retry to reuse the key.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Evicts all expired entries. Returns the count removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    fn ttl_as_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(300))
    }

    /// Spawns a background task that sweeps every `interval` until `shutdown`
    /// fires, mirroring the reference engine's shutdown-aware loops.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "idempotency sweep evicted expired entries");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}
