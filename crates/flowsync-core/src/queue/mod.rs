//! Persistent job queue (spec.md §4.4, §6).

mod memory;
mod postgres;

pub use memory::InMemoryJobQueue;
pub use postgres::PostgresJobQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{JobStatus, WorkerJob};
use crate::error::FlowSyncError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: u64,
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
}

/// The durable queue contract. `dequeue` must be atomic and serializable
/// against concurrent workers (`SELECT ... FOR UPDATE SKIP LOCKED` + `UPDATE`
/// for the Postgres backend).
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: WorkerJob) -> Result<(), FlowSyncError>;

    /// Dequeue the oldest pending job, locking it for `worker_id`.
    /// Returns `None` when no eligible row exists — not an error.
    async fn dequeue(&self, worker_id: &str) -> Result<Option<WorkerJob>, FlowSyncError>;

    async fn mark_done(&self, id: Uuid, result: serde_json::Value) -> Result<(), FlowSyncError>;

    async fn mark_failed(&self, id: Uuid, error: String) -> Result<(), FlowSyncError>;

    /// Re-enqueue a failed attempt with a fresh `attempt` counter, used by
    /// the Consumer's retry path. Resets `status` to `pending` so it is
    /// eligible for dequeue again.
    async fn retry(&self, job: WorkerJob) -> Result<(), FlowSyncError>;

    async fn status(&self, id: Uuid) -> Result<Option<JobStatus>, FlowSyncError>;

    async fn stats(&self) -> Result<QueueStats, FlowSyncError>;

    /// Reset `processing` rows whose lock is older than `threshold` back to
    /// `pending`, incrementing their attempt count. Rows that have exhausted
    /// `maxAttempts` are left alone for the Consumer to route to the DLQ.
    /// Returns the ids of rows reclaimed.
    async fn reclaim_stale(&self, threshold: chrono::Duration) -> Result<Vec<Uuid>, FlowSyncError>;

    /// When a row was last locked, if it is currently `processing`.
    async fn locked_at(&self, id: Uuid) -> Result<Option<DateTime<Utc>>, FlowSyncError>;
}
