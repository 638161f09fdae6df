//! Process-local completion signal bus (spec.md §6, §9).
//!
//! "One-shot signal per `done:<executionId>`" is a promise keyed by execution
//! id: the Orchestrator registers interest before publishing the first job,
//! and the Result Handler completes it exactly once per execution's terminal
//! transition. Registration must happen before enqueueing to avoid a lost
//! wakeup if the execution finishes before the Orchestrator starts waiting.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub status: CompletionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A concurrent map from execution id to a one-shot completion channel.
#[derive(Default)]
pub struct CompletionBus {
    waiters: DashMap<Uuid, oneshot::Sender<CompletionSignal>>,
}

impl CompletionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `execution_id`'s terminal signal. Must be called
    /// before the first job for that execution is published.
    pub fn register(&self, execution_id: Uuid) -> oneshot::Receiver<CompletionSignal> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(execution_id, tx);
        rx
    }

    /// Deliver the terminal signal. A no-op if nobody is waiting (the
    /// Orchestrator already gave up, e.g. on timeout) or if it already fired.
    pub fn complete(&self, execution_id: Uuid, signal: CompletionSignal) {
        if let Some((_, tx)) = self.waiters.remove(&execution_id) {
            let _ = tx.send(signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_waiter_receives_the_completion_signal() {
        let bus = CompletionBus::new();
        let execution_id = Uuid::now_v7();
        let rx = bus.register(execution_id);
        bus.complete(
            execution_id,
            CompletionSignal {
                status: CompletionOutcome::Completed,
                output: Some(serde_json::json!({"a": 1})),
                error: None,
            },
        );
        let signal = rx.await.unwrap();
        assert_eq!(signal.status, CompletionOutcome::Completed);
    }

    #[test]
    fn completing_with_no_waiter_is_a_no_op() {
        let bus = CompletionBus::new();
        bus.complete(
            Uuid::now_v7(),
            CompletionSignal {
                status: CompletionOutcome::Failed,
                output: None,
                error: Some("boom".into()),
            },
        );
    }
}
