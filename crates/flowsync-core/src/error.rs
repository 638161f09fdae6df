//! Top-level error kinds (spec.md §7).

use uuid::Uuid;

/// Errors surfaced across the orchestration core.
///
/// Handler failures never reach this type directly — they are captured as a
/// typed [`crate::handler::HandlerResult`] and only escalate to
/// [`FlowSyncError::StepTerminallyFailed`] once retries are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum FlowSyncError {
    #[error("workflow definition is invalid: {0:?}")]
    Validation(Vec<String>),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("workflow {0} is not active")]
    NotActive(Uuid),

    #[error("step {node_id} terminally failed: {message}")]
    StepTerminallyFailed { node_id: String, message: String },

    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    #[error("execution {0} timed out")]
    Timeout(Uuid),

    #[error("execution {0} was cancelled")]
    Cancelled(Uuid),
}

impl From<sqlx::Error> for FlowSyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Infrastructure(err.to_string())
    }
}

impl From<serde_json::Error> for FlowSyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infrastructure(format!("serialization error: {err}"))
    }
}
