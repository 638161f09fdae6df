//! Result handler: advances the DAG after a step settles (spec.md §4.10).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::{ConditionBranch, Edge, ExecutionStatus, NodeType, StepExecution, StepStatus, WorkflowDefinition};
use crate::error::FlowSyncError;
use crate::handler::{HandlerResult, HandlerStatus};
use crate::observability::Observability;
use crate::publisher::{JobPublisher, PublishRequest};
use crate::signal::{CompletionBus, CompletionOutcome, CompletionSignal};
use crate::store::ExecutionStore;

pub struct ResultHandler {
    store: Arc<dyn ExecutionStore>,
    publisher: Arc<JobPublisher>,
    bus: Arc<CompletionBus>,
    observability: Arc<Observability>,
}

impl ResultHandler {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        publisher: Arc<JobPublisher>,
        bus: Arc<CompletionBus>,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            store,
            publisher,
            bus,
            observability,
        }
    }

    #[instrument(skip(self, result), fields(step_id = %result.step_id))]
    pub async fn handle(&self, result: HandlerResult) -> Result<(), FlowSyncError> {
        let now = Utc::now();
        let mut step = self
            .store
            .get_step(result.step_id)
            .await?
            .ok_or_else(|| FlowSyncError::NotFound {
                what: "step",
                id: result.step_id.to_string(),
            })?;

        step.status = match result.status {
            HandlerStatus::Completed => StepStatus::Completed,
            HandlerStatus::Failed => StepStatus::Failed,
        };
        step.result = result.result.clone();
        step.error = result.error.clone();
        step.completed_at = Some(now);
        self.store.update_step(step.clone()).await?;

        let mut execution = self
            .store
            .get_execution(step.execution_id)
            .await?
            .ok_or_else(|| FlowSyncError::NotFound {
                what: "execution",
                id: step.execution_id.to_string(),
            })?;

        if execution.status != ExecutionStatus::Running {
            debug!(execution_id = %execution.id, status = ?execution.status, "result arrived for a non-running execution, recording only");
            return Ok(());
        }

        if step.status == StepStatus::Failed {
            execution.status = ExecutionStatus::Failed;
            execution.error = step.error.clone();
            execution.completed_at = Some(now);
            self.store.update_execution(execution.clone()).await?;

            for mut pending in self.store.steps_for_execution(execution.id).await? {
                if pending.status == StepStatus::Pending {
                    pending.status = StepStatus::Skipped;
                    pending.completed_at = Some(now);
                    self.store.update_step(pending).await?;
                }
            }

            self.observability.audit.record(
                "execution.failed",
                "execution",
                execution.id.to_string(),
                serde_json::json!({"error": execution.error}),
            );
            self.bus.complete(
                execution.id,
                CompletionSignal {
                    status: CompletionOutcome::Failed,
                    output: None,
                    error: execution.error.clone(),
                },
            );
            return Ok(());
        }

        self.advance(execution, step).await
    }

    async fn advance(&self, mut execution: crate::domain::Execution, step: StepExecution) -> Result<(), FlowSyncError> {
        let now = Utc::now();
        let workflow = self
            .store
            .get_workflow(execution.workflow_id)
            .await?
            .ok_or_else(|| FlowSyncError::NotFound {
                what: "workflow",
                id: execution.workflow_id.to_string(),
            })?;
        let definition = &workflow.definition;

        let steps = self.store.steps_for_execution(execution.id).await?;
        let mut steps_by_node: HashMap<String, StepStatus> =
            steps.iter().map(|s| (s.node_id.clone(), s.status)).collect();
        let mut results: Map<String, Value> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.result.clone().map(|r| (s.node_id.clone(), r)))
            .collect();

        let out_edges: Vec<Edge> = definition.out_edges(&step.node_id).cloned().collect();

        let (_selected, not_selected): (Vec<Edge>, Vec<Edge>) = if step.node_type == NodeType::Condition {
            let branch_true = step
                .result
                .as_ref()
                .and_then(|r| r.get("result"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let wanted = if branch_true { ConditionBranch::True } else { ConditionBranch::False };
            out_edges
                .into_iter()
                .partition(|e| e.condition_branch.is_none() || e.condition_branch == Some(wanted))
        } else {
            (out_edges, Vec::new())
        };

        let mut visited = HashSet::new();
        for edge in &not_selected {
            self.skip_branch(definition, &edge.target, execution.id, &mut steps_by_node, &mut visited)
                .await?;
        }

        let mut any_ready = false;
        for node in &definition.nodes {
            if steps_by_node.contains_key(&node.id) {
                continue;
            }
            let in_edges: Vec<&Edge> = definition.in_edges(&node.id).collect();
            if in_edges.is_empty() {
                continue;
            }
            let ready = in_edges.iter().all(|e| {
                matches!(
                    steps_by_node.get(&e.source),
                    Some(StepStatus::Completed) | Some(StepStatus::Skipped)
                )
            });
            if !ready {
                continue;
            }
            any_ready = true;
            let previous_results = Value::Object(results.clone());
            self.publisher
                .publish(PublishRequest::new(execution.id, node.clone(), execution.input.clone(), previous_results))
                .await?;
            steps_by_node.insert(node.id.clone(), StepStatus::Pending);
        }

        let pending_or_running = steps_by_node
            .values()
            .any(|s| matches!(s, StepStatus::Pending | StepStatus::Running));

        if !any_ready && !pending_or_running {
            execution.status = ExecutionStatus::Completed;
            execution.output = Some(Value::Object(std::mem::take(&mut results)));
            execution.completed_at = Some(now);
            self.store.update_execution(execution.clone()).await?;
            self.observability.audit.record(
                "execution.completed",
                "execution",
                execution.id.to_string(),
                serde_json::json!({}),
            );
            self.bus.complete(
                execution.id,
                CompletionSignal {
                    status: CompletionOutcome::Completed,
                    output: execution.output.clone(),
                    error: None,
                },
            );
        }

        Ok(())
    }

    /// Recursively marks `node_id` and its downstream nodes `skipped`,
    /// stopping at any node with another incoming edge whose source hasn't
    /// settled yet (a `join`, or any node two branches merge into) — such a
    /// node's fate is left to the normal ready-set accounting in
    /// [`Self::advance`], which already waits for every in-edge to be
    /// `Completed` or `Skipped` — and at any node that already has a
    /// settled or in-flight step.
    fn skip_branch<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
        node_id: &'a str,
        execution_id: Uuid,
        steps_by_node: &'a mut HashMap<String, StepStatus>,
        visited: &'a mut HashSet<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), FlowSyncError>> + Send + 'a>> {
        Box::pin(async move {
            if visited.contains(node_id) {
                return Ok(());
            }
            visited.insert(node_id.to_string());

            let Some(node) = definition.node(node_id) else {
                return Ok(());
            };

            let in_edges: Vec<&Edge> = definition.in_edges(node_id).collect();
            if in_edges.len() > 1 {
                let all_settled = in_edges.iter().all(|e| {
                    matches!(
                        steps_by_node.get(&e.source),
                        Some(StepStatus::Completed) | Some(StepStatus::Skipped)
                    )
                });
                if !all_settled {
                    // Another branch into this convergence point is still
                    // live; don't decide its fate here.
                    return Ok(());
                }
            }

            match steps_by_node.get(node_id) {
                Some(StepStatus::Completed) | Some(StepStatus::Pending) | Some(StepStatus::Running) => return Ok(()),
                Some(StepStatus::Skipped) => {}
                _ => {
                    let now = Utc::now();
                    let skipped = StepExecution {
                        id: Uuid::now_v7(),
                        execution_id,
                        node_id: node.id.clone(),
                        node_label: node.label.clone(),
                        node_type: node.node_type,
                        status: StepStatus::Skipped,
                        attempts: 0,
                        result: None,
                        error: None,
                        started_at: Some(now),
                        completed_at: Some(now),
                    };
                    self.store.create_step(skipped).await?;
                    steps_by_node.insert(node_id.to_string(), StepStatus::Skipped);
                }
            }

            for edge in definition.out_edges(node_id) {
                self.skip_branch(definition, &edge.target, execution_id, steps_by_node, visited)
                    .await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressureController;
    use crate::domain::{Execution, ExecutionStatus, Node, NodeType, Workflow, WorkflowStatus};
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

    fn edge(id: &str, source: &str, target: &str, branch: Option<ConditionBranch>) -> Edge {
        Edge {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition_branch: branch,
        }
    }

    struct Harness {
        handler: ResultHandler,
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryJobQueue>,
        bus: Arc<CompletionBus>,
    }

    async fn harness(definition: WorkflowDefinition, execution_id: Uuid) -> Harness {
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
        store.save_workflow(workflow.clone()).await.unwrap();
        store
            .create_execution(Execution {
                id: execution_id,
                workflow_id: workflow.id,
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

        Harness {
            handler: ResultHandler::new(store.clone(), publisher, bus.clone(), observability),
            store,
            queue,
            bus,
        }
    }

    fn completed_step(execution_id: Uuid, node: &Node, result: Value) -> StepExecution {
        StepExecution {
            id: Uuid::now_v7(),
            execution_id,
            node_id: node.id.clone(),
            node_label: node.label.clone(),
            node_type: node.node_type,
            status: StepStatus::Completed,
            attempts: 1,
            result: Some(result),
            error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn linear_path_advances_to_the_next_node_then_completes() {
        let start = node("start", NodeType::Start);
        let a = node("A", NodeType::Action);
        let end = node("end", NodeType::End);
        let definition = WorkflowDefinition {
            nodes: vec![start.clone(), a.clone(), end.clone()],
            edges: vec![edge("e1", "start", "A", None), edge("e2", "A", "end", None)],
        };
        let execution_id = Uuid::now_v7();
        let h = harness(definition, execution_id).await;

        let step = completed_step(execution_id, &start, json!({"message": "ok"}));
        let step_id = step.id;
        h.store.create_step(step).await.unwrap();

        h.handler
            .handle(HandlerResult {
                job_id: step_id,
                step_id,
                execution_id,
                status: HandlerStatus::Completed,
                result: Some(json!({"message": "ok"})),
                error: None,
                duration_ms: 1,
                retryable: None,
            })
            .await
            .unwrap();

        // `A` should now be published.
        assert_eq!(h.queue.stats().await.unwrap().depth, 1);
        let execution = h.store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn condition_false_branch_skips_the_true_branch() {
        let c = node("C", NodeType::Condition);
        let t = node("T", NodeType::Action);
        let f = node("F", NodeType::Action);
        let end = node("end", NodeType::End);
        let definition = WorkflowDefinition {
            nodes: vec![c.clone(), t.clone(), f.clone(), end.clone()],
            edges: vec![
                edge("e1", "C", "T", Some(ConditionBranch::True)),
                edge("e2", "C", "F", Some(ConditionBranch::False)),
                edge("e3", "T", "end", None),
                edge("e4", "F", "end", None),
            ],
        };
        let execution_id = Uuid::now_v7();
        let h = harness(definition, execution_id).await;

        let step = completed_step(execution_id, &c, json!({"result": false}));
        let step_id = step.id;
        h.store.create_step(step).await.unwrap();

        h.handler
            .handle(HandlerResult {
                job_id: step_id,
                step_id,
                execution_id,
                status: HandlerStatus::Completed,
                result: Some(json!({"result": false})),
                error: None,
                duration_ms: 1,
                retryable: None,
            })
            .await
            .unwrap();

        let steps = h.store.steps_for_execution(execution_id).await.unwrap();
        let t_step = steps.iter().find(|s| s.node_id == "T").unwrap();
        assert_eq!(t_step.status, StepStatus::Skipped);
        assert_eq!(h.queue.stats().await.unwrap().depth, 1); // only F published
    }

    #[tokio::test]
    async fn failed_step_fails_execution_and_skips_remaining_pending_steps() {
        let a = node("A", NodeType::Action);
        let b = node("B", NodeType::Action);
        let definition = WorkflowDefinition {
            nodes: vec![a.clone(), b.clone()],
            edges: vec![],
        };
        let execution_id = Uuid::now_v7();
        let h = harness(definition, execution_id).await;

        let a_step = StepExecution {
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
        };
        let a_step_id = a_step.id;
        h.store.create_step(a_step).await.unwrap();

        let b_step = StepExecution {
            id: Uuid::now_v7(),
            execution_id,
            node_id: "B".into(),
            node_label: "B".into(),
            node_type: NodeType::Action,
            status: StepStatus::Pending,
            attempts: 1,
            result: None,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        h.store.create_step(b_step).await.unwrap();

        let rx = h.bus.register(execution_id);

        h.handler
            .handle(HandlerResult {
                job_id: a_step_id,
                step_id: a_step_id,
                execution_id,
                status: HandlerStatus::Failed,
                result: None,
                error: Some("boom".into()),
                duration_ms: 1,
                retryable: Some(false),
            })
            .await
            .unwrap();

        let execution = h.store.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        let steps = h.store.steps_for_execution(execution_id).await.unwrap();
        let b = steps.iter().find(|s| s.node_id == "B").unwrap();
        assert_eq!(b.status, StepStatus::Skipped);
        let signal = rx.await.unwrap();
        assert_eq!(signal.status, CompletionOutcome::Failed);
    }

    #[tokio::test]
    async fn non_running_execution_is_not_advanced() {
        let a = node("A", NodeType::Action);
        let end = node("end", NodeType::End);
        let definition = WorkflowDefinition {
            nodes: vec![a.clone(), end.clone()],
            edges: vec![edge("e1", "A", "end", None)],
        };
        let execution_id = Uuid::now_v7();
        let h = harness(definition, execution_id).await;

        let mut execution = h.store.get_execution(execution_id).await.unwrap().unwrap();
        execution.status = ExecutionStatus::Cancelled;
        h.store.update_execution(execution).await.unwrap();

        let step = completed_step(execution_id, &a, json!({}));
        let step_id = step.id;
        h.store.create_step(step).await.unwrap();

        h.handler
            .handle(HandlerResult {
                job_id: step_id,
                step_id,
                execution_id,
                status: HandlerStatus::Completed,
                result: Some(json!({})),
                error: None,
                duration_ms: 1,
                retryable: None,
            })
            .await
            .unwrap();

        assert_eq!(h.queue.stats().await.unwrap().depth, 0);
    }
}
