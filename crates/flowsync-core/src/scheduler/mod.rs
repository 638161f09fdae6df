//! Cron scheduler: periodically fires workflows whose triggers are due
//! (spec.md §4.12).

pub mod cron;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};

use crate::domain::{TriggerType, WorkflowStatus};
use crate::error::FlowSyncError;
use crate::observability::Observability;
use crate::orchestrator::Orchestrator;
use crate::store::ExecutionStore;
use cron::CronSchedule;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
        }
    }
}

/// Ticks on an interval, looking for enabled cron triggers that are due and
/// firing their workflow via the [`Orchestrator`]. Ticks never overlap: a
/// tick that is still evaluating triggers when the next one would fire is
/// skipped rather than queued.
pub struct Scheduler {
    store: Arc<dyn ExecutionStore>,
    orchestrator: Arc<Orchestrator>,
    observability: Arc<Observability>,
    config: SchedulerConfig,
    tick_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        orchestrator: Arc<Orchestrator>,
        observability: Arc<Observability>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            store,
            orchestrator,
            observability,
            config,
            tick_lock: Mutex::new(()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut shutdown = scheduler.shutdown_rx.clone();
            let mut ticker = tokio::time::interval(scheduler.config.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = scheduler.tick().await {
                            error!(error = %err, "scheduler tick failed");
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
        info!(interval_secs = self.config.tick_interval.as_secs(), "scheduler started");
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    #[instrument(skip(self))]
    async fn tick(&self) -> Result<(), FlowSyncError> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            warn!("previous scheduler tick still running, skipping this one");
            return Ok(());
        };

        let now = Utc::now();
        for trigger in self.store.triggers().await? {
            if trigger.trigger_type != TriggerType::Cron || !trigger.enabled {
                continue;
            }

            let Some(expression) = trigger.cron_expression() else {
                continue;
            };
            let schedule = match CronSchedule::parse(expression) {
                Ok(schedule) => schedule,
                Err(err) => {
                    warn!(trigger_id = %trigger.id, error = %err, "invalid cron expression, skipping");
                    continue;
                }
            };

            if !schedule.should_run(now) {
                continue;
            }

            // Anti-double-fire: skip if already fired within this same
            // calendar minute (a tick that runs slightly late, or a
            // process restart close to a fire time, must not re-fire).
            if let Some(last_fired) = trigger.last_fired_at {
                if same_minute(last_fired, now) {
                    continue;
                }
            }

            let workflow = match self.store.get_workflow(trigger.workflow_id).await? {
                Some(workflow) => workflow,
                None => {
                    warn!(trigger_id = %trigger.id, "trigger references a missing workflow");
                    continue;
                }
            };
            if workflow.status != WorkflowStatus::Active {
                continue;
            }

            let mut updated = trigger.clone();
            updated.last_fired_at = Some(now);
            updated.next_run_at = schedule.next_run_time(now);
            self.store.upsert_trigger(updated).await?;

            self.observability.audit.record(
                "trigger.fired",
                "trigger",
                trigger.id.to_string(),
                serde_json::json!({"workflowId": trigger.workflow_id}),
            );
            self.observability.metrics.increment("triggers_fired", "cron");

            let orchestrator = self.orchestrator.clone();
            let workflow_id = trigger.workflow_id;
            tokio::spawn(async move {
                if let Err(err) = orchestrator.execute_workflow(workflow_id, None, None).await {
                    error!(error = %err, workflow_id = %workflow_id, "scheduled execution failed to start");
                }
            });
        }

        Ok(())
    }
}

fn same_minute(a: chrono::DateTime<Utc>, b: chrono::DateTime<Utc>) -> bool {
    use chrono::Timelike;
    a.date_naive() == b.date_naive() && a.hour() == b.hour() && a.minute() == b.minute()
}
