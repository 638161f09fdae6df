//! Dead-letter sink for permanently failed jobs (spec.md §4.5).

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::domain::WorkerJob;

#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub job: WorkerJob,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterStats {
    pub count: usize,
}

/// Append-only collection of exhausted jobs. Entries are never retried
/// automatically — [`Self::requeue`] is an explicit operator action.
#[derive(Default)]
pub struct DeadLetterSink {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl DeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, job: WorkerJob, error: String, attempts: u32) {
        self.entries.write().push(DeadLetterEntry {
            job,
            error,
            attempts,
            failed_at: Utc::now(),
        });
    }

    pub fn items(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().clone()
    }

    pub fn stats(&self) -> DeadLetterStats {
        DeadLetterStats {
            count: self.entries.read().len(),
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Re-enqueues a copy of `job_id`'s job with a fresh id and attempts
    /// reset to zero. Returns the new job's id, or `None` if no such entry
    /// exists in the sink.
    pub fn requeue(&self, job_id: Uuid) -> Option<WorkerJob> {
        let mut entries = self.entries.write();
        let idx = entries.iter().position(|e| e.job.id == job_id)?;
        let mut job = entries.remove(idx).job;
        job.id = Uuid::now_v7();
        job.attempt = 0;
        Some(job)
    }
}
