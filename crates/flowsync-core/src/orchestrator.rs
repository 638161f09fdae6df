//! Orchestrator: starts executions and awaits their completion (spec.md §4.11).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{Execution, ExecutionStatus, Node, StepStatus, Workflow, WorkflowStatus};
use crate::error::FlowSyncError;
use crate::observability::Observability;
use crate::publisher::{JobPublisher, PublishRequest};
use crate::signal::{CompletionBus, CompletionOutcome};
use crate::store::ExecutionStore;

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

pub struct Orchestrator {
    store: Arc<dyn ExecutionStore>,
    publisher: Arc<JobPublisher>,
    bus: Arc<CompletionBus>,
    observability: Arc<Observability>,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        publisher: Arc<JobPublisher>,
        bus: Arc<CompletionBus>,
        observability: Arc<Observability>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            bus,
            observability,
            timeout,
        }
    }

    #[instrument(skip(self, input), fields(workflow_id = %workflow_id))]
    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        input: Option<Value>,
        user_id: Option<String>,
    ) -> Result<ExecutionOutcome, FlowSyncError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| FlowSyncError::NotFound {
                what: "workflow",
                id: workflow_id.to_string(),
            })?;

        if workflow.status != WorkflowStatus::Active {
            return Err(FlowSyncError::NotActive(workflow_id));
        }

        let input = input.unwrap_or(Value::Object(Default::default()));
        let now = Utc::now();
        let execution_id = Uuid::now_v7();
        let execution = Execution {
            id: execution_id,
            workflow_id,
            workflow_version: workflow.version,
            status: ExecutionStatus::Running,
            input: input.clone(),
            output: None,
            error: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            user_id,
        };
        self.store.create_execution(execution).await?;

        self.observability.audit.record(
            "execution.started",
            "execution",
            execution_id.to_string(),
            serde_json::json!({"workflowId": workflow_id}),
        );
        self.observability.metrics.increment("executions_started", "workflow");

        let initial_nodes = self.initial_nodes(&workflow);
        if initial_nodes.is_empty() {
            return self.complete_empty(execution_id).await;
        }

        // Register before publishing the first job, so a same-tick
        // completion can never race ahead of the waiter.
        let rx = self.bus.register(execution_id);

        for node in initial_nodes {
            self.publisher
                .publish(PublishRequest::new(execution_id, node.clone(), input.clone(), Value::Object(Default::default())))
                .await?;
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(signal)) => Ok(ExecutionOutcome {
                execution_id,
                status: match signal.status {
                    CompletionOutcome::Completed => ExecutionStatus::Completed,
                    CompletionOutcome::Failed => ExecutionStatus::Failed,
                },
                output: signal.output,
                error: signal.error,
            }),
            Ok(Err(_)) => Ok(ExecutionOutcome {
                execution_id,
                status: ExecutionStatus::Failed,
                output: None,
                error: Some("completion signal dropped".into()),
            }),
            Err(_) => {
                warn!(execution_id = %execution_id, "orchestrator deadline exceeded");
                Ok(ExecutionOutcome {
                    execution_id,
                    status: ExecutionStatus::Failed,
                    output: None,
                    error: Some("Execution timed out (5m)".into()),
                })
            }
        }
    }

    /// Cancels `execution_id`: flips it to `cancelled` and sweeps
    /// pending/running steps to `skipped`. In-flight handlers are not
    /// preempted; their eventual results are discarded by the Result
    /// Handler, which refuses to advance a non-running execution.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), FlowSyncError> {
        let mut execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| FlowSyncError::NotFound {
                what: "execution",
                id: execution_id.to_string(),
            })?;

        if execution.status.is_terminal() {
            return Ok(());
        }

        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(Utc::now());
        self.store.update_execution(execution).await?;

        for mut step in self.store.steps_for_execution(execution_id).await? {
            if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                step.status = StepStatus::Skipped;
                step.completed_at = Some(Utc::now());
                self.store.update_step(step).await?;
            }
        }

        self.observability
            .audit
            .record("execution.cancelled", "execution", execution_id.to_string(), serde_json::json!({}));
        info!(execution_id = %execution_id, "execution cancelled");
        Ok(())
    }

    fn initial_nodes<'a>(&self, workflow: &'a Workflow) -> Vec<&'a Node> {
        workflow
            .definition
            .nodes
            .iter()
            .filter(|n| workflow.definition.in_edges(&n.id).next().is_none())
            .collect()
    }

    async fn complete_empty(&self, execution_id: Uuid) -> Result<ExecutionOutcome, FlowSyncError> {
        let mut execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| FlowSyncError::NotFound {
                what: "execution",
                id: execution_id.to_string(),
            })?;
        execution.status = ExecutionStatus::Completed;
        execution.output = Some(Value::Object(Default::default()));
        execution.completed_at = Some(Utc::now());
        self.store.update_execution(execution).await?;
        Ok(ExecutionOutcome {
            execution_id,
            status: ExecutionStatus::Completed,
            output: Some(Value::Object(Default::default())),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressureController;
    use crate::domain::{Node, NodeType, WorkflowDefinition};
    use crate::idempotency::IdempotencyStore;
    use crate::queue::InMemoryJobQueue;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn node(id: &str, node_type: NodeType) -> Node {
        Node {
            id: id.to_string(),
            node_type,
            label: id.to_string(),
            config: json!({}),
            position: None,
        }
    }

    async fn setup(definition: WorkflowDefinition) -> (Orchestrator, Arc<InMemoryStore>, Arc<InMemoryJobQueue>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let idempotency = Arc::new(IdempotencyStore::default());
        let backpressure = Arc::new(BackpressureController::new(Default::default()));
        let publisher = Arc::new(JobPublisher::new(store.clone(), queue.clone(), idempotency, backpressure));
        let bus = Arc::new(CompletionBus::new());
        let observability = Arc::new(Observability::new());

        let workflow = Workflow {
            id: Uuid::now_v7(),
            version: 1,
            name: "wf".into(),
            definition,
            status: WorkflowStatus::Active,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let workflow_id = workflow.id;
        store.save_workflow(workflow).await.unwrap();

        let orchestrator = Orchestrator::new(store.clone(), publisher, bus, observability, Duration::from_secs(5));
        (orchestrator, store, queue, workflow_id)
    }

    #[tokio::test]
    async fn rejects_non_active_workflow() {
        let definition = WorkflowDefinition::default();
        let (orchestrator, store, _queue, workflow_id) = setup(definition).await;
        let mut workflow = store.get_workflow(workflow_id).await.unwrap().unwrap();
        workflow.status = WorkflowStatus::Draft;
        store.save_workflow(workflow).await.unwrap();

        let err = orchestrator.execute_workflow(workflow_id, None, None).await.unwrap_err();
        assert!(matches!(err, FlowSyncError::NotActive(_)));
    }

    #[tokio::test]
    async fn empty_definition_completes_immediately() {
        let definition = WorkflowDefinition::default();
        let (orchestrator, _store, _queue, workflow_id) = setup(definition).await;
        let outcome = orchestrator.execute_workflow(workflow_id, None, None).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn publishes_a_job_per_initial_node() {
        let definition = WorkflowDefinition {
            nodes: vec![node("start", NodeType::Start)],
            edges: vec![],
        };
        let (orchestrator, _store, queue, workflow_id) = setup(definition).await;

        // The orchestrator will time out waiting for the (never-run)
        // consumer/result-handler pipeline; we only assert the initial
        // publish happened before that deadline fires.
        let handle = tokio::spawn(async move { orchestrator.execute_workflow(workflow_id, None, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.stats().await.unwrap().depth, 1);
        handle.abort();
    }

    #[tokio::test]
    async fn cancel_sweeps_pending_and_running_steps_to_skipped() {
        let definition = WorkflowDefinition::default();
        let (orchestrator, store, _queue, _workflow_id) = setup(definition).await;
        let execution_id = Uuid::now_v7();
        store
            .create_execution(Execution {
                id: execution_id,
                workflow_id: Uuid::now_v7(),
                workflow_version: 1,
                status: ExecutionStatus::Running,
                input: json!({}),
                output: None,
                error: None,
                started_at: Some(Utc::now()),
                completed_at: None,
                created_at: Utc::now(),
                user_id: None,
            })
            .await
            .unwrap();
        store
            .create_step(crate::domain::StepExecution {
                id: Uuid::now_v7(),
                execution_id,
                node_id: "A".into(),
                node_label: "A".into(),
                node_type: NodeType::Action,
                status: StepStatus::Running,
                attempts: 1,
                result: None,
                error: None,
                started_at: Some(Utc::now()),
                completed_at: None,
            })
            .await
            .unwrap();

        orchestrator.cancel(execution_id).await.unwrap();

        let execution = store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        let steps = store.steps_for_execution(execution_id).await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Skipped);
    }
}
