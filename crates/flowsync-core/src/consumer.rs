//! Job consumer / worker pool (spec.md §4.9, §5; SPEC_FULL §C.1, §C.2).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::dlq::DeadLetterSink;
use crate::domain::{StepStatus, WorkerJob};
use crate::error::FlowSyncError;
use crate::handler::{HandlerRegistry, HandlerResult, HandlerStatus};
use crate::heartbeat::HeartbeatMonitor;
use crate::idempotency::IdempotencyStore;
use crate::observability::Observability;
use crate::publisher::JobPublisher;
use crate::queue::JobQueue;
use crate::result_handler::ResultHandler;
use crate::store::ExecutionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub reclaim_interval: Duration,
    pub stale_threshold: chrono::Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poll_interval: Duration::from_millis(500),
            reclaim_interval: Duration::from_secs(30),
            stale_threshold: chrono::Duration::seconds(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Parallel worker pool: up to `config.max_concurrency` jobs in flight at
/// once, retry/backoff, DLQ routing, and a background scavenger for rows
/// left `processing` by a crashed worker.
pub struct JobConsumer {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn ExecutionStore>,
    handlers: Arc<HandlerRegistry>,
    idempotency: Arc<IdempotencyStore>,
    dlq: Arc<DeadLetterSink>,
    heartbeat: Arc<HeartbeatMonitor>,
    result_handler: Arc<ResultHandler>,
    publisher: Arc<JobPublisher>,
    observability: Arc<Observability>,
    config: ConsumerConfig,
    semaphore: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_jobs: AtomicU64,
}

impl JobConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn ExecutionStore>,
        handlers: Arc<HandlerRegistry>,
        idempotency: Arc<IdempotencyStore>,
        dlq: Arc<DeadLetterSink>,
        heartbeat: Arc<HeartbeatMonitor>,
        result_handler: Arc<ResultHandler>,
        publisher: Arc<JobPublisher>,
        observability: Arc<Observability>,
        config: ConsumerConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            queue,
            store,
            handlers,
            idempotency,
            dlq,
            heartbeat,
            result_handler,
            publisher,
            observability,
            config,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Starting),
            active_jobs: AtomicU64::new(0),
        })
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn active_jobs(&self) -> u64 {
        self.active_jobs.load(Ordering::Relaxed)
    }

    /// Starts the poll loop and the stale-reclamation loop as background
    /// tasks. Returns immediately; call [`Self::shutdown`] to drain.
    pub fn start(self: &Arc<Self>) {
        *self.status.write() = WorkerPoolStatus::Running;
        self.spawn_poll_loop();
        self.spawn_reclaim_loop();
        info!(max_concurrency = self.config.max_concurrency, "worker pool started");
    }

    fn spawn_poll_loop(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut shutdown = pool.shutdown_rx.clone();
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let permit = tokio::select! {
                    permit = pool.semaphore.clone().acquire_owned() => permit.expect("semaphore never closed"),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; } else { continue; }
                    }
                };

                match pool.queue.dequeue("worker").await {
                    Ok(Some(job)) => {
                        let pool = pool.clone();
                        pool.active_jobs.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(async move {
                            pool.run_job(job).await;
                            pool.active_jobs.fetch_sub(1, Ordering::Relaxed);
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        tokio::select! {
                            _ = tokio::time::sleep(pool.config.poll_interval) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    Err(err) => {
                        drop(permit);
                        error!(error = %err, "dequeue failed");
                        tokio::time::sleep(pool.config.poll_interval).await;
                    }
                }
            }
        });
    }

    fn spawn_reclaim_loop(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut shutdown = pool.shutdown_rx.clone();
            let mut ticker = tokio::time::interval(pool.config.reclaim_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match pool.queue.reclaim_stale(pool.config.stale_threshold).await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                warn!(count = reclaimed.len(), "reclaimed stale processing rows");
                            }
                            Ok(_) => {}
                            Err(err) => error!(error = %err, "stale reclamation failed"),
                        }
                        match pool.publisher.drain_deferred(pool.config.stale_threshold).await {
                            Ok(republished) if republished > 0 => {
                                warn!(count = republished, "republished backpressure-deferred jobs");
                            }
                            Ok(_) => {}
                            Err(err) => error!(error = %err, "deferred publish re-scan failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stops dispatching new jobs, waits up to `shutdown_timeout` for active
    /// jobs to drain, then returns even if some remain in flight.
    pub async fn shutdown(&self) {
        *self.status.write() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while self.active_jobs() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.active_jobs() > 0 {
            warn!(remaining = self.active_jobs(), "shutdown timed out with jobs still in flight");
        }
        *self.status.write() = WorkerPoolStatus::Stopped;
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, node_id = %job.node.id))]
    async fn run_job(&self, job: WorkerJob) {
        self.heartbeat.register(job.id, job.execution_id, job.node.label.clone());

        if !self.mark_running(&job).await {
            self.heartbeat.deregister(job.id);
            return;
        }

        let result = self.execute(&job).await;

        let queue_result = match result.status {
            HandlerStatus::Completed => {
                self.queue.mark_done(job.id, result.result.clone().unwrap_or(serde_json::Value::Null)).await
            }
            HandlerStatus::Failed => {
                self.queue.mark_failed(job.id, result.error.clone().unwrap_or_default()).await
            }
        };
        if let Err(err) = queue_result {
            error!(error = %err, "failed to reflect terminal queue state");
        }

        let failed = result.status == HandlerStatus::Failed;
        let retryable = result.retryable.unwrap_or(true);
        let has_attempts_remaining = job.retry_policy.has_attempts_remaining(job.attempt);

        if failed && retryable && has_attempts_remaining {
            self.retry(job, result).await;
            self.heartbeat.deregister(job.id);
            return;
        }

        if failed && job.max_retries > 0 {
            self.observability.metrics.increment("dlq_entries", job.node.node_type.as_str());
            self.observability.audit.record(
                "dlq.entry",
                "job",
                job.id.to_string(),
                serde_json::json!({"error": result.error, "attempts": job.attempt}),
            );
            self.dlq.add(job.clone(), result.error.clone().unwrap_or_default(), job.attempt);
        }

        if let Err(err) = self.result_handler.handle(result).await {
            error!(error = %err, "result handler failed to advance the DAG");
        }

        self.heartbeat.deregister(job.id);
    }

    /// Marks the step `running`, unless it was concurrently cancelled or
    /// skipped — in which case the queue row is marked failed and the
    /// caller must abort without invoking a handler.
    async fn mark_running(&self, job: &WorkerJob) -> bool {
        let step = match self.store.get_step(job.id).await {
            Ok(Some(step)) => step,
            Ok(None) => {
                error!("step row missing for dequeued job");
                let _ = self.queue.mark_failed(job.id, "step row missing".into()).await;
                return false;
            }
            Err(err) => {
                error!(error = %err, "failed to load step for running transition");
                return false;
            }
        };

        if step.status != StepStatus::Pending {
            debug!(status = ?step.status, "step no longer pending, aborting dispatch");
            let _ = self
                .queue
                .mark_failed(job.id, format!("step is {:?}, not pending", step.status))
                .await;
            return false;
        }

        let mut step = step;
        step.status = StepStatus::Running;
        step.attempts = job.attempt;
        step.started_at = Some(Utc::now());
        if let Err(err) = self.store.update_step(step).await {
            error!(error = %err, "failed to persist running transition");
            return false;
        }
        true
    }

    async fn execute(&self, job: &WorkerJob) -> HandlerResult {
        let started = std::time::Instant::now();
        let Some(handler) = self.handlers.get(job.node.node_type) else {
            return HandlerResult {
                job_id: job.id,
                step_id: job.id,
                execution_id: job.execution_id,
                status: HandlerStatus::Failed,
                result: None,
                error: Some(format!("no handler registered for node type {}", job.node.node_type)),
                duration_ms: started.elapsed().as_millis() as u64,
                retryable: Some(false),
            };
        };

        match std::panic::AssertUnwindSafe(handler.execute(job)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => HandlerResult {
                job_id: job.id,
                step_id: job.id,
                execution_id: job.execution_id,
                status: HandlerStatus::Failed,
                result: None,
                error: Some("handler panicked".into()),
                duration_ms: started.elapsed().as_millis() as u64,
                retryable: Some(true),
            },
        }
    }

    /// Retry path (spec.md §4.9 step 6): the idempotency key must be cleared
    /// *before* re-enqueueing, or the republish is rejected as a duplicate.
    async fn retry(&self, job: WorkerJob, result: HandlerResult) {
        let next_attempt = job.attempt + 1;
        let delay = job.retry_policy.delay_for_attempt(job.attempt);

        if let Ok(Some(mut step)) = self.store.get_step(job.id).await {
            step.status = StepStatus::Pending;
            step.error = Some(format!(
                "Retry {}/{}: {}",
                job.attempt,
                job.max_retries + 1,
                result.error.clone().unwrap_or_default()
            ));
            step.attempts = job.attempt;
            step.completed_at = None;
            let _ = self.store.update_step(step).await;
        }

        let key = IdempotencyStore::key(job.execution_id, &job.node.id);
        self.idempotency.remove(&key);
        self.observability.metrics.increment("retries", job.node.node_type.as_str());

        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut next = job;
            next.attempt = next_attempt;
            if let Err(err) = queue.retry(next).await {
                error!(error = %err, "failed to re-enqueue retry");
            }
        });
    }
}
