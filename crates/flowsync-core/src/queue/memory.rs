//! In-memory `JobQueue`, used by tests and the CLI's `--no-db` mode.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{JobQueue, QueueStats};
use crate::domain::{JobStatus, WorkerJob};
use crate::error::FlowSyncError;

struct Row {
    status: JobStatus,
    payload: WorkerJob,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    result: Option<serde_json::Value>,
    error: Option<String>,
}

#[derive(Default)]
struct Inner {
    /// FIFO order of pending job ids, oldest first.
    pending: VecDeque<Uuid>,
    rows: std::collections::HashMap<Uuid, Row>,
}

/// A process-local job queue backed by a mutex-guarded map.
///
/// `dequeue` takes the lock for the whole select-and-update, which is the
/// in-memory equivalent of `SELECT ... FOR UPDATE SKIP LOCKED` — there is
/// nothing to skip since nothing else can observe a half-updated row.
pub struct InMemoryJobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    total_enqueued: AtomicU64,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            total_enqueued: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }

    /// Resolves when a job is enqueued, for latency-sensitive opportunistic
    /// pickup between poll intervals.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: WorkerJob) -> Result<(), FlowSyncError> {
        let mut inner = self.inner.lock();
        let id = job.id;
        inner.pending.push_back(id);
        inner.rows.insert(
            id,
            Row {
                status: JobStatus::Pending,
                payload: job,
                locked_at: None,
                locked_by: None,
                result: None,
                error: None,
            },
        );
        drop(inner);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<WorkerJob>, FlowSyncError> {
        let mut inner = self.inner.lock();
        let Some(id) = inner.pending.pop_front() else {
            return Ok(None);
        };
        let now = Utc::now();
        let row = inner
            .rows
            .get_mut(&id)
            .expect("pending id always has a row");
        row.status = JobStatus::Processing;
        row.locked_at = Some(now);
        row.locked_by = Some(worker_id.to_string());
        Ok(Some(row.payload.clone()))
    }

    async fn mark_done(&self, id: Uuid, result: serde_json::Value) -> Result<(), FlowSyncError> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.rows.get_mut(&id) {
            row.status = JobStatus::Done;
            row.result = Some(result);
            row.locked_at = None;
            row.locked_by = None;
        }
        drop(inner);
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: String) -> Result<(), FlowSyncError> {
        let mut inner = self.inner.lock();
        if let Some(row) = inner.rows.get_mut(&id) {
            row.status = JobStatus::Failed;
            row.error = Some(error);
            row.locked_at = None;
            row.locked_by = None;
        }
        drop(inner);
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn retry(&self, job: WorkerJob) -> Result<(), FlowSyncError> {
        let mut inner = self.inner.lock();
        let id = job.id;
        inner.pending.push_back(id);
        inner.rows.insert(
            id,
            Row {
                status: JobStatus::Pending,
                payload: job,
                locked_at: None,
                locked_by: None,
                result: None,
                error: None,
            },
        );
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn status(&self, id: Uuid) -> Result<Option<JobStatus>, FlowSyncError> {
        Ok(self.inner.lock().rows.get(&id).map(|r| r.status))
    }

    async fn stats(&self) -> Result<QueueStats, FlowSyncError> {
        let depth = self.inner.lock().pending.len() as u64;
        Ok(QueueStats {
            depth,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_processed: self.total_processed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        })
    }

    async fn reclaim_stale(&self, threshold: chrono::Duration) -> Result<Vec<Uuid>, FlowSyncError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for (id, row) in inner.rows.iter_mut() {
            if row.status == JobStatus::Processing {
                if let Some(locked_at) = row.locked_at {
                    if now - locked_at > threshold {
                        row.status = JobStatus::Pending;
                        row.locked_at = None;
                        row.locked_by = None;
                        row.payload.attempt += 1;
                        reclaimed.push(*id);
                    }
                }
            }
        }
        for id in &reclaimed {
            inner.pending.push_back(*id);
        }
        Ok(reclaimed)
    }

    async fn locked_at(&self, id: Uuid) -> Result<Option<DateTime<Utc>>, FlowSyncError> {
        Ok(self.inner.lock().rows.get(&id).and_then(|r| r.locked_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use serde_json::json;

    fn job(id: Uuid) -> WorkerJob {
        WorkerJob {
            id,
            execution_id: Uuid::now_v7(),
            node: crate::domain::Node {
                id: "a".into(),
                node_type: crate::domain::NodeType::Action,
                label: "A".into(),
                config: json!({}),
                position: None,
            },
            input: json!({}),
            previous_results: json!({}),
            attempt: 0,
            max_retries: 0,
            retry_policy: RetryPolicy::default(),
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_returns_the_payload_unchanged() {
        let q = InMemoryJobQueue::new();
        let id = Uuid::now_v7();
        q.enqueue(job(id)).await.unwrap();
        let dequeued = q.dequeue("w1").await.unwrap().unwrap();
        assert_eq!(dequeued.id, id);
        assert_eq!(dequeued.attempt, 0);
        assert_eq!(q.status(id).await.unwrap(), Some(JobStatus::Processing));
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_returns_none() {
        let q = InMemoryJobQueue::new();
        assert!(q.dequeue("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q = InMemoryJobQueue::new();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::now_v7()).collect();
        for id in &ids {
            q.enqueue(job(*id)).await.unwrap();
        }
        for expected in &ids {
            let j = q.dequeue("w").await.unwrap().unwrap();
            assert_eq!(j.id, *expected);
        }
    }

    #[tokio::test]
    async fn mark_done_updates_status_and_stats() {
        let q = InMemoryJobQueue::new();
        let id = Uuid::now_v7();
        q.enqueue(job(id)).await.unwrap();
        q.dequeue("w1").await.unwrap();
        q.mark_done(id, json!({"ok": true})).await.unwrap();
        assert_eq!(q.status(id).await.unwrap(), Some(JobStatus::Done));
        assert_eq!(q.stats().await.unwrap().total_processed, 1);
    }

    #[tokio::test]
    async fn reclaim_stale_resets_processing_rows_past_threshold() {
        let q = InMemoryJobQueue::new();
        let id = Uuid::now_v7();
        q.enqueue(job(id)).await.unwrap();
        q.dequeue("w1").await.unwrap();
        // Force the lock to look old.
        q.inner.lock().rows.get_mut(&id).unwrap().locked_at =
            Some(Utc::now() - chrono::Duration::seconds(120));
        let reclaimed = q.reclaim_stale(chrono::Duration::seconds(60)).await.unwrap();
        assert_eq!(reclaimed, vec![id]);
        assert_eq!(q.status(id).await.unwrap(), Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn concurrent_dequeue_each_job_consumed_exactly_once() {
        use std::sync::Arc;
        let q = Arc::new(InMemoryJobQueue::new());
        for _ in 0..100 {
            q.enqueue(job(Uuid::now_v7())).await.unwrap();
        }
        let mut handles = Vec::new();
        let seen = Arc::new(Mutex::new(std::collections::HashSet::new()));
        for _ in 0..10 {
            let q = q.clone();
            let seen = seen.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    match q.dequeue("w").await.unwrap() {
                        Some(j) => {
                            let mut seen = seen.lock();
                            assert!(seen.insert(j.id), "job consumed twice");
                            drop(seen);
                            q.mark_done(j.id, json!({})).await.unwrap();
                        }
                        None => break,
                    }
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(seen.lock().len(), 100);
        assert_eq!(q.stats().await.unwrap().total_processed, 100);
    }
}
