//! Core durable workflow orchestration engine.
//!
//! A workflow is a DAG of nodes. An execution runs that DAG to completion,
//! dispatching one job per ready node through a durable queue, advancing the
//! DAG as results land, and retrying or dead-lettering failed steps. See the
//! module docs below for where each concern lives.

pub mod backpressure;
pub mod config;
pub mod consumer;
pub mod dag;
pub mod dlq;
pub mod domain;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod idempotency;
pub mod observability;
pub mod orchestrator;
pub mod publisher;
pub mod queue;
pub mod reliability;
pub mod result_handler;
pub mod scheduler;
pub mod signal;
pub mod store;

/// Re-exports of the types most call sites need, mirroring the module
/// layout above so `use flowsync_core::prelude::*;` is usually enough.
pub mod prelude {
    pub use crate::backpressure::{BackpressureConfig, BackpressureController, BackpressureLevel};
    pub use crate::config::EngineConfig;
    pub use crate::consumer::{ConsumerConfig, JobConsumer, WorkerPoolStatus};
    pub use crate::dlq::{DeadLetterEntry, DeadLetterSink, DeadLetterStats};
    pub use crate::domain::{
        ConditionBranch, Edge, Execution, ExecutionStatus, JobQueueRow, JobStatus, Node, NodeType,
        StepExecution, StepStatus, Trigger, TriggerType, Workflow, WorkflowDefinition, WorkflowStatus,
    };
    pub use crate::error::FlowSyncError;
    pub use crate::handler::{Handler, HandlerRegistry, HandlerResult, HandlerStatus};
    pub use crate::heartbeat::{HeartbeatMonitor, HeartbeatRecord, HeartbeatStatus};
    pub use crate::idempotency::IdempotencyStore;
    pub use crate::observability::Observability;
    pub use crate::orchestrator::{ExecutionOutcome, Orchestrator};
    pub use crate::publisher::{JobPublisher, PublishRequest};
    pub use crate::queue::{JobQueue, QueueStats};
    pub use crate::reliability::RetryPolicy;
    pub use crate::result_handler::ResultHandler;
    pub use crate::scheduler::{cron::CronSchedule, Scheduler, SchedulerConfig};
    pub use crate::signal::{CompletionBus, CompletionOutcome, CompletionSignal};
    pub use crate::store::ExecutionStore;
}
