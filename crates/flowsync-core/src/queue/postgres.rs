//! PostgreSQL-backed `JobQueue`.
//!
//! Schema (`flowsync_job_queue`):
//!
//! ```sql
//! CREATE TABLE flowsync_job_queue (
//!     id              UUID PRIMARY KEY,
//!     execution_id    UUID NOT NULL,
//!     node_id         TEXT NOT NULL,
//!     node_label      TEXT NOT NULL,
//!     node_type       TEXT NOT NULL,
//!     payload         JSONB NOT NULL,
//!     status          TEXT NOT NULL DEFAULT 'pending',
//!     attempts        INTEGER NOT NULL DEFAULT 0,
//!     max_attempts    INTEGER NOT NULL,
//!     locked_at       TIMESTAMPTZ,
//!     locked_by       TEXT,
//!     result          JSONB,
//!     error           TEXT,
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//!
//! CREATE INDEX flowsync_job_queue_status_created_idx
//!     ON flowsync_job_queue (status, created_at);
//! ```
//!
//! `dequeue` is a single `WITH ... FOR UPDATE SKIP LOCKED` + `UPDATE`
//! statement so the select-and-claim is atomic and serializable against
//! concurrent workers without an application-level lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::{JobQueue, QueueStats};
use crate::domain::{JobStatus, WorkerJob};
use crate::error::FlowSyncError;

#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Done => "done",
        JobStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> JobStatus {
    match s {
        "processing" => JobStatus::Processing,
        "done" => JobStatus::Done,
        "failed" => JobStatus::Failed,
        _ => JobStatus::Pending,
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    #[instrument(skip(self, job))]
    async fn enqueue(&self, job: WorkerJob) -> Result<(), FlowSyncError> {
        let payload = serde_json::to_value(&job)?;
        let max_attempts = job.max_retries as i32 + 1;

        sqlx::query(
            r#"
            INSERT INTO flowsync_job_queue
                (id, execution_id, node_id, node_label, node_type, payload, status, attempts, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7)
            "#,
        )
        .bind(job.id)
        .bind(job.execution_id)
        .bind(&job.node.id)
        .bind(&job.node.label)
        .bind(job.node.node_type.as_str())
        .bind(&payload)
        .bind(max_attempts)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to enqueue job");
            FlowSyncError::from(e)
        })?;

        debug!(job_id = %job.id, "enqueued job");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn dequeue(&self, worker_id: &str) -> Result<Option<WorkerJob>, FlowSyncError> {
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM flowsync_job_queue
                WHERE status = 'pending'
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE flowsync_job_queue q
            SET status = 'processing',
                locked_at = now(),
                locked_by = $1,
                attempts = attempts + 1
            FROM claimable c
            WHERE q.id = c.id
            RETURNING q.payload, q.attempts
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(FlowSyncError::from)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: serde_json::Value = row.get("payload");
        let job: WorkerJob = serde_json::from_value(payload)?;
        Ok(Some(job))
    }

    async fn mark_done(&self, id: Uuid, result: serde_json::Value) -> Result<(), FlowSyncError> {
        sqlx::query("UPDATE flowsync_job_queue SET status = 'done', result = $2 WHERE id = $1")
            .bind(id)
            .bind(result)
            .execute(&self.pool)
            .await
            .map_err(FlowSyncError::from)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: String) -> Result<(), FlowSyncError> {
        sqlx::query("UPDATE flowsync_job_queue SET status = 'failed', error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(FlowSyncError::from)?;
        Ok(())
    }

    async fn retry(&self, job: WorkerJob) -> Result<(), FlowSyncError> {
        let payload = serde_json::to_value(&job)?;
        sqlx::query(
            r#"
            UPDATE flowsync_job_queue
            SET status = 'pending', payload = $2, locked_at = NULL, locked_by = NULL
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(FlowSyncError::from)?;
        Ok(())
    }

    async fn status(&self, id: Uuid) -> Result<Option<JobStatus>, FlowSyncError> {
        let row = sqlx::query("SELECT status FROM flowsync_job_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(FlowSyncError::from)?;
        Ok(row.map(|r| parse_status(r.get::<String, _>("status").as_str())))
    }

    async fn stats(&self) -> Result<QueueStats, FlowSyncError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS depth,
                COUNT(*) AS total_enqueued,
                COUNT(*) FILTER (WHERE status = 'done') AS total_processed,
                COUNT(*) FILTER (WHERE status = 'failed') AS total_failed
            FROM flowsync_job_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(FlowSyncError::from)?;

        Ok(QueueStats {
            depth: row.get::<i64, _>("depth") as u64,
            total_enqueued: row.get::<i64, _>("total_enqueued") as u64,
            total_processed: row.get::<i64, _>("total_processed") as u64,
            total_failed: row.get::<i64, _>("total_failed") as u64,
        })
    }

    #[instrument(skip(self))]
    async fn reclaim_stale(&self, threshold: chrono::Duration) -> Result<Vec<Uuid>, FlowSyncError> {
        let cutoff = Utc::now() - threshold;
        let rows = sqlx::query(
            r#"
            UPDATE flowsync_job_queue
            SET status = 'pending', locked_at = NULL, locked_by = NULL, attempts = attempts + 1
            WHERE status = 'processing' AND locked_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(FlowSyncError::from)?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        if !ids.is_empty() {
            debug!(count = ids.len(), "reclaimed stale jobs");
        }
        Ok(ids)
    }

    async fn locked_at(&self, id: Uuid) -> Result<Option<DateTime<Utc>>, FlowSyncError> {
        let row = sqlx::query("SELECT locked_at FROM flowsync_job_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(FlowSyncError::from)?;
        Ok(row.and_then(|r| r.get::<Option<DateTime<Utc>>, _>("locked_at")))
    }
}
