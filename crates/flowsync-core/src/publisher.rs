//! Job publisher (spec.md §4.8).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::backpressure::BackpressureController;
use crate::domain::{Node, StepExecution, WorkerJob};
use crate::error::FlowSyncError;
use crate::idempotency::IdempotencyStore;
use crate::queue::JobQueue;
use crate::reliability::RetryPolicy;
use crate::store::ExecutionStore;

pub struct PublishRequest {
    pub execution_id: Uuid,
    pub node: Node,
    pub input: serde_json::Value,
    pub previous_results: serde_json::Value,
    pub attempt: u32,
}

impl PublishRequest {
    pub fn new(
        execution_id: Uuid,
        node: Node,
        input: serde_json::Value,
        previous_results: serde_json::Value,
    ) -> Self {
        Self {
            execution_id,
            node,
            input,
            previous_results,
            attempt: 1,
        }
    }
}

pub struct JobPublisher {
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn JobQueue>,
    idempotency: Arc<IdempotencyStore>,
    backpressure: Arc<BackpressureController>,
    rejected: AtomicU64,
    /// Jobs whose step row was created but which backpressure refused to
    /// enqueue. Drained by [`Self::drain_deferred`] — the Consumer's
    /// reclaim loop re-scan for backpressure-dropped jobs (spec.md §9 Open
    /// Question 1).
    deferred: Mutex<Vec<(DateTime<Utc>, WorkerJob)>>,
}

impl JobPublisher {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        queue: Arc<dyn JobQueue>,
        idempotency: Arc<IdempotencyStore>,
        backpressure: Arc<BackpressureController>,
    ) -> Self {
        Self {
            store,
            queue,
            idempotency,
            backpressure,
            rejected: AtomicU64::new(0),
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Re-attempts enqueueing jobs that were deferred by a prior
    /// backpressure rejection and are now older than `threshold`. A job
    /// still rejected on re-attempt stays deferred for the next scan.
    pub async fn drain_deferred(&self, threshold: chrono::Duration) -> Result<usize, FlowSyncError> {
        let now = Utc::now();
        let due: Vec<WorkerJob> = {
            let mut deferred = self.deferred.lock();
            let (due, still_waiting): (Vec<_>, Vec<_>) =
                deferred.drain(..).partition(|(deferred_at, _)| now - *deferred_at >= threshold);
            *deferred = still_waiting;
            due.into_iter().map(|(_, job)| job).collect()
        };

        let mut republished = 0;
        for job in due {
            if self.backpressure.should_accept() {
                self.queue.enqueue(job).await?;
                republished += 1;
            } else {
                self.deferred.lock().push((now, job));
            }
        }
        Ok(republished)
    }

    #[instrument(skip(self, request), fields(node_id = %request.node.id))]
    pub async fn publish(&self, request: PublishRequest) -> Result<Uuid, FlowSyncError> {
        let retry_policy: RetryPolicy = request
            .node
            .config
            .get("retry")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let now = Utc::now();
        let step = StepExecution::new_pending(
            request.execution_id,
            &request.node,
            request.attempt,
            now,
        );
        self.store.create_step(step.clone()).await?;

        let key = IdempotencyStore::key(request.execution_id, &request.node.id);
        let check = self.idempotency.check_and_set(&key, step.id);
        if check.duplicate {
            self.store.delete_step(step.id).await?;
            return Ok(check
                .existing_step_id
                .expect("duplicate result always carries the original id"));
        }

        let job = WorkerJob {
            id: step.id,
            execution_id: request.execution_id,
            node: request.node,
            input: request.input,
            previous_results: request.previous_results,
            attempt: request.attempt,
            max_retries: retry_policy.max_retries,
            retry_policy,
        };

        if !self.backpressure.should_accept() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(node_id = %job.node.id, step_id = %step.id, "publish rejected by backpressure, deferring");
            self.deferred.lock().push((now, job));
            return Ok(step.id);
        }

        self.queue.enqueue(job).await?;

        Ok(step.id)
    }

    pub async fn publish_many(&self, requests: Vec<PublishRequest>) -> Result<Vec<Uuid>, FlowSyncError> {
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            ids.push(self.publish(request).await?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NodeType, StepStatus};
    use crate::queue::InMemoryJobQueue;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            node_type: NodeType::Action,
            label: id.to_string(),
            config: json!({}),
            position: None,
        }
    }

    fn publisher() -> (JobPublisher, Arc<InMemoryStore>, Arc<InMemoryJobQueue>) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let idempotency = Arc::new(IdempotencyStore::default());
        let backpressure = Arc::new(BackpressureController::new(Default::default()));
        (
            JobPublisher::new(store.clone(), queue.clone(), idempotency, backpressure),
            store,
            queue,
        )
    }

    #[tokio::test]
    async fn publish_creates_pending_step_and_enqueues() {
        let (publisher, store, queue) = publisher();
        let execution_id = Uuid::now_v7();
        let step_id = publisher
            .publish(PublishRequest::new(execution_id, node("A"), json!({}), json!({})))
            .await
            .unwrap();

        let step = store.get_step(step_id).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(queue.stats().await.unwrap().depth, 1);
    }

    #[tokio::test]
    async fn duplicate_publish_is_deduplicated_and_original_step_kept() {
        let (publisher, store, queue) = publisher();
        let execution_id = Uuid::now_v7();
        let first = publisher
            .publish(PublishRequest::new(execution_id, node("A"), json!({}), json!({})))
            .await
            .unwrap();
        let second = publisher
            .publish(PublishRequest::new(execution_id, node("A"), json!({}), json!({})))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(queue.stats().await.unwrap().depth, 1);
        assert!(store.get_step(first).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn backpressure_rejection_returns_step_id_without_enqueueing() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let idempotency = Arc::new(IdempotencyStore::default());
        let backpressure = Arc::new(BackpressureController::new(Default::default()));
        backpressure.observe_depth(1000); // force rejecting
        let publisher = JobPublisher::new(store.clone(), queue.clone(), idempotency, backpressure);

        let execution_id = Uuid::now_v7();
        let step_id = publisher
            .publish(PublishRequest::new(execution_id, node("A"), json!({}), json!({})))
            .await
            .unwrap();

        assert_eq!(queue.stats().await.unwrap().depth, 0);
        let step = store.get_step(step_id).await.unwrap().unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(publisher.rejected_count(), 1);
    }

    #[tokio::test]
    async fn deferred_job_is_enqueued_once_backpressure_clears() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let idempotency = Arc::new(IdempotencyStore::default());
        let backpressure = Arc::new(BackpressureController::new(Default::default()));
        backpressure.observe_depth(1000); // force rejecting
        let publisher = JobPublisher::new(store, queue.clone(), idempotency, backpressure.clone());

        publisher
            .publish(PublishRequest::new(Uuid::now_v7(), node("A"), json!({}), json!({})))
            .await
            .unwrap();
        assert_eq!(publisher.deferred_count(), 1);
        assert_eq!(queue.stats().await.unwrap().depth, 0);

        backpressure.observe_depth(0); // back to accepting
        let republished = publisher.drain_deferred(chrono::Duration::zero()).await.unwrap();

        assert_eq!(republished, 1);
        assert_eq!(publisher.deferred_count(), 0);
        assert_eq!(queue.stats().await.unwrap().depth, 1);
    }

    #[tokio::test]
    async fn drain_deferred_ignores_entries_younger_than_threshold() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let idempotency = Arc::new(IdempotencyStore::default());
        let backpressure = Arc::new(BackpressureController::new(Default::default()));
        backpressure.observe_depth(1000);
        let publisher = JobPublisher::new(store, queue.clone(), idempotency, backpressure.clone());

        publisher
            .publish(PublishRequest::new(Uuid::now_v7(), node("A"), json!({}), json!({})))
            .await
            .unwrap();
        backpressure.observe_depth(0);

        let republished = publisher.drain_deferred(chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(republished, 0);
        assert_eq!(publisher.deferred_count(), 1);
    }

    #[tokio::test]
    async fn retry_policy_is_read_from_node_config() {
        let (publisher, _store, queue) = publisher();
        let mut n = node("A");
        n.config = json!({"retry": {"maxRetries": 3, "backoffMs": 10, "backoffMultiplier": 2.0}});
        publisher
            .publish(PublishRequest::new(Uuid::now_v7(), n, json!({}), json!({})))
            .await
            .unwrap();
        let job = queue.dequeue("w").await.unwrap().unwrap();
        assert_eq!(job.max_retries, 3);
        let _ = Duration::from_millis(0);
    }
}
