//! Heartbeat monitor for in-flight jobs (spec.md §4.7).
//!
//! Stall detection is observational only — nothing here kills or reclaims a
//! job; that is the Consumer's stale-reclamation loop, driven by the queue's
//! `locked_at` rather than this monitor's heartbeats.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HeartbeatRecord {
    pub job_id: Uuid,
    pub execution_id: Uuid,
    pub node_label: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatStatus {
    pub in_flight: usize,
    pub stalled: Vec<HeartbeatRecord>,
}

pub struct HeartbeatMonitor {
    records: DashMap<Uuid, HeartbeatRecord>,
    stall_threshold: Duration,
}

impl HeartbeatMonitor {
    pub fn new(stall_threshold: Duration) -> Self {
        Self {
            records: DashMap::new(),
            stall_threshold,
        }
    }

    pub fn register(&self, job_id: Uuid, execution_id: Uuid, node_label: impl Into<String>) {
        let now = Utc::now();
        self.records.insert(
            job_id,
            HeartbeatRecord {
                job_id,
                execution_id,
                node_label: node_label.into(),
                started_at: now,
                last_heartbeat: now,
            },
        );
    }

    pub fn heartbeat(&self, job_id: Uuid) {
        if let Some(mut record) = self.records.get_mut(&job_id) {
            record.last_heartbeat = Utc::now();
        }
    }

    pub fn deregister(&self, job_id: Uuid) {
        self.records.remove(&job_id);
    }

    fn is_stalled(&self, record: &HeartbeatRecord, now: DateTime<Utc>) -> bool {
        let threshold = chrono::Duration::from_std(self.stall_threshold)
            .unwrap_or(chrono::Duration::seconds(30));
        now - record.last_heartbeat > threshold
    }

    pub fn status(&self) -> HeartbeatStatus {
        let now = Utc::now();
        let mut stalled = Vec::new();
        for entry in self.records.iter() {
            if self.is_stalled(entry.value(), now) {
                stalled.push(entry.value().clone());
            }
        }
        HeartbeatStatus {
            in_flight: self.records.len(),
            stalled,
        }
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
