//! Counters indexed by `nodeType` (spec.md §4.13, §9 Open Question #2).
//!
//! The source this engine is modeled on indexes step-level metrics by
//! `stepId` in one code path and by `nodeType` in another; `nodeType` is the
//! one that matches the snapshot shape operators actually query, so every
//! counter here is `(metric_name, node_type) -> count`.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    counters: DashMap<(String, String), AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, metric: &str, node_type: &str) {
        self.counters
            .entry((metric.to_string(), node_type.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, metric: &str, node_type: &str) -> u64 {
        self.counters
            .get(&(metric.to_string(), node_type.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot as `"metric:nodeType" -> count`, for the CLI's `status` view.
    pub fn snapshot(&self) -> std::collections::HashMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| {
                let (metric, node_type) = entry.key();
                (format!("{metric}:{node_type}"), entry.value().load(Ordering::Relaxed))
            })
            .collect()
    }
}
