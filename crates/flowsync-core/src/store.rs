//! The execution-state store: workflows, executions, steps, triggers.
//!
//! `spec.md` specifies these as entity shapes and leaves "persistence
//! mechanics beyond the entity shapes and the FOR UPDATE SKIP LOCKED dequeue
//! requirement" out of scope — the only schema it mandates is the job queue
//! table (`spec.md` §6). This trait is the seam the Publisher, Consumer,
//! Result Handler, Orchestrator, and Scheduler use to read and write that
//! state, following the same store-trait-plus-in-memory-variant split as
//! the job queue.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::domain::{Execution, StepExecution, Trigger, Workflow};
use crate::error::FlowSyncError;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, FlowSyncError>;
    async fn save_workflow(&self, workflow: Workflow) -> Result<(), FlowSyncError>;

    async fn create_execution(&self, execution: Execution) -> Result<(), FlowSyncError>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, FlowSyncError>;
    async fn update_execution(&self, execution: Execution) -> Result<(), FlowSyncError>;

    async fn create_step(&self, step: StepExecution) -> Result<(), FlowSyncError>;
    async fn get_step(&self, id: Uuid) -> Result<Option<StepExecution>, FlowSyncError>;
    async fn update_step(&self, step: StepExecution) -> Result<(), FlowSyncError>;
    async fn delete_step(&self, id: Uuid) -> Result<(), FlowSyncError>;
    async fn steps_for_execution(&self, execution_id: Uuid) -> Result<Vec<StepExecution>, FlowSyncError>;

    async fn upsert_trigger(&self, trigger: Trigger) -> Result<(), FlowSyncError>;
    async fn triggers(&self) -> Result<Vec<Trigger>, FlowSyncError>;
}

/// Process-local store backed by `DashMap`s. Used by the CLI's `--no-db`
/// mode and by every unit/integration test in this crate.
#[derive(Default)]
pub struct InMemoryStore {
    workflows: DashMap<Uuid, Workflow>,
    executions: DashMap<Uuid, Execution>,
    steps: DashMap<Uuid, StepExecution>,
    triggers: DashMap<Uuid, Trigger>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, FlowSyncError> {
        Ok(self.workflows.get(&id).map(|w| w.clone()))
    }

    async fn save_workflow(&self, workflow: Workflow) -> Result<(), FlowSyncError> {
        self.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn create_execution(&self, execution: Execution) -> Result<(), FlowSyncError> {
        self.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, FlowSyncError> {
        Ok(self.executions.get(&id).map(|e| e.clone()))
    }

    async fn update_execution(&self, execution: Execution) -> Result<(), FlowSyncError> {
        self.executions.insert(execution.id, execution);
        Ok(())
    }

    async fn create_step(&self, step: StepExecution) -> Result<(), FlowSyncError> {
        self.steps.insert(step.id, step);
        Ok(())
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepExecution>, FlowSyncError> {
        Ok(self.steps.get(&id).map(|s| s.clone()))
    }

    async fn update_step(&self, step: StepExecution) -> Result<(), FlowSyncError> {
        self.steps.insert(step.id, step);
        Ok(())
    }

    async fn delete_step(&self, id: Uuid) -> Result<(), FlowSyncError> {
        self.steps.remove(&id);
        Ok(())
    }

    async fn steps_for_execution(&self, execution_id: Uuid) -> Result<Vec<StepExecution>, FlowSyncError> {
        Ok(self
            .steps
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .map(|s| s.clone())
            .collect())
    }

    async fn upsert_trigger(&self, trigger: Trigger) -> Result<(), FlowSyncError> {
        self.triggers.insert(trigger.id, trigger);
        Ok(())
    }

    async fn triggers(&self) -> Result<Vec<Trigger>, FlowSyncError> {
        Ok(self.triggers.iter().map(|t| t.clone()).collect())
    }
}
