//! Handler registry and node-type handlers (spec.md §4.2, §6).

mod builtin;
pub mod expr;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{NodeType, WorkerJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    Completed,
    Failed,
}

/// The shape returned from `execute(job)` per spec.md §6's handler contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerResult {
    pub job_id: Uuid,
    pub step_id: Uuid,
    pub execution_id: Uuid,
    pub status: HandlerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl HandlerResult {
    fn completed(job: &WorkerJob, result: serde_json::Value, started: Instant) -> Self {
        Self {
            job_id: job.id,
            step_id: job.id,
            execution_id: job.execution_id,
            status: HandlerStatus::Completed,
            result: Some(result),
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
            retryable: None,
        }
    }

    fn failed(job: &WorkerJob, error: impl Into<String>, retryable: bool, started: Instant) -> Self {
        Self {
            job_id: job.id,
            step_id: job.id,
            execution_id: job.execution_id,
            status: HandlerStatus::Failed,
            result: None,
            error: Some(error.into()),
            duration_ms: started.elapsed().as_millis() as u64,
            retryable: Some(retryable),
        }
    }
}

/// A node-type handler. Implementations must be idempotent with respect to
/// external side effects when they report `retryable: true`.
#[async_trait]
pub trait Handler: Send + Sync {
    fn node_type(&self) -> NodeType;

    async fn execute(&self, job: &WorkerJob) -> HandlerResult;
}

/// String-keyed `node.type → Handler` mapping.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers
            .insert(handler.node_type().as_str().to_string(), handler);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn Handler>> {
        self.handlers.get(node_type.as_str()).cloned()
    }

    pub fn has(&self, node_type: NodeType) -> bool {
        self.handlers.contains_key(node_type.as_str())
    }

    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// A registry pre-populated with all nine built-in node-type handlers, so
    /// the engine is usable without any manual wiring.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::StartHandler));
        registry.register(Arc::new(builtin::EndHandler));
        registry.register(Arc::new(builtin::ActionHandler::new()));
        registry.register(Arc::new(builtin::ConditionHandler));
        registry.register(Arc::new(builtin::DelayHandler));
        registry.register(Arc::new(builtin::ForkHandler));
        registry.register(Arc::new(builtin::JoinHandler));
        registry.register(Arc::new(builtin::TransformHandler));
        registry.register(Arc::new(builtin::WebhookResponseHandler));
        registry
    }
}
