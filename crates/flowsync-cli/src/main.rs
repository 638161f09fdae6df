//! `flowsync` — operator CLI for validating and running workflow
//! definitions against the core engine in-process.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowsync_core::prelude::*;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "flowsync", version, about = "Operator CLI for the FlowSync durable workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a workflow definition file for structural errors.
    Validate {
        /// Path to a JSON workflow definition (`{"nodes": [...], "edges": [...]}`).
        file: PathBuf,
    },
    /// Run a workflow definition to completion once, printing the outcome.
    Run {
        /// Path to a JSON workflow definition.
        file: PathBuf,
        /// JSON input for the execution. Defaults to `{}`.
        #[arg(long)]
        input: Option<String>,
        /// Postgres connection string for the job queue. Defaults to an
        /// in-process in-memory queue.
        #[arg(long)]
        database_url: Option<String>,
        /// Seconds to wait for the execution to settle before giving up.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Report the depth and lifetime counters of a Postgres-backed queue.
    QueueStats {
        #[arg(long)]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { file } => validate(&file),
        Command::Run {
            file,
            input,
            database_url,
            timeout_secs,
        } => run(&file, input, database_url, timeout_secs).await,
        Command::QueueStats { database_url } => queue_stats(&database_url).await,
    }
}

fn load_definition(file: &PathBuf) -> Result<WorkflowDefinition> {
    let raw = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {} as a workflow definition", file.display()))
}

fn validate(file: &PathBuf) -> Result<()> {
    let definition = load_definition(file)?;
    let report = flowsync_core::dag::validate(&definition);
    if report.ok() {
        println!("valid: {} nodes, {} edges", definition.nodes.len(), definition.edges.len());
        Ok(())
    } else {
        for error in &report.errors {
            eprintln!("error: {error}");
        }
        anyhow::bail!("{} validation error(s)", report.errors.len());
    }
}

async fn run(file: &PathBuf, input: Option<String>, database_url: Option<String>, timeout_secs: u64) -> Result<()> {
    let definition = load_definition(file)?;
    let report = flowsync_core::dag::validate(&definition);
    if !report.ok() {
        for error in &report.errors {
            eprintln!("error: {error}");
        }
        anyhow::bail!("refusing to run an invalid workflow definition");
    }

    let input: serde_json::Value = match input {
        Some(raw) => serde_json::from_str(&raw).context("parsing --input as JSON")?,
        None => serde_json::json!({}),
    };

    let config = EngineConfig::default();
    let store: Arc<dyn ExecutionStore> = Arc::new(flowsync_core::store::InMemoryStore::new());
    let queue: Arc<dyn JobQueue> = match database_url {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .connect(&url)
                .await
                .context("connecting to Postgres")?;
            Arc::new(flowsync_core::queue::PostgresJobQueue::new(pool))
        }
        None => Arc::new(flowsync_core::queue::InMemoryJobQueue::new()),
    };
    let idempotency = Arc::new(IdempotencyStore::new(config.idempotency_ttl));
    let backpressure = Arc::new(BackpressureController::new(config.backpressure.clone()));
    let heartbeat = Arc::new(HeartbeatMonitor::new(config.heartbeat_stall_threshold));
    let dlq = Arc::new(DeadLetterSink::new());
    let observability = Arc::new(Observability::new());
    let bus = Arc::new(CompletionBus::new());
    let handlers = Arc::new(HandlerRegistry::builtin());

    let publisher = Arc::new(JobPublisher::new(store.clone(), queue.clone(), idempotency.clone(), backpressure));
    let result_handler = Arc::new(ResultHandler::new(store.clone(), publisher.clone(), bus.clone(), observability.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        publisher.clone(),
        bus,
        observability.clone(),
        Duration::from_secs(timeout_secs),
    ));

    let consumer = JobConsumer::new(
        queue.clone(),
        store.clone(),
        handlers,
        idempotency,
        dlq.clone(),
        heartbeat,
        result_handler,
        publisher,
        observability.clone(),
        ConsumerConfig::default(),
    );
    consumer.start();

    let workflow = Workflow {
        id: Uuid::now_v7(),
        version: 1,
        name: file.display().to_string(),
        definition,
        status: WorkflowStatus::Active,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    let workflow_id = workflow.id;
    store.save_workflow(workflow).await?;

    let outcome = orchestrator.execute_workflow(workflow_id, Some(input), None).await?;
    consumer.shutdown().await;

    println!("status: {:?}", outcome.status);
    if let Some(output) = &outcome.output {
        println!("output: {output}");
    }
    if let Some(error) = &outcome.error {
        println!("error: {error}");
    }

    let queue_stats = queue.stats().await?;
    println!(
        "queue: depth={} enqueued={} processed={} failed={}",
        queue_stats.depth, queue_stats.total_enqueued, queue_stats.total_processed, queue_stats.total_failed
    );
    let dlq_stats = dlq.stats();
    println!("dlq: {} entr{}", dlq_stats.count, if dlq_stats.count == 1 { "y" } else { "ies" });
    for entry in dlq.items() {
        println!("  - {} ({}): {}", entry.job.id, entry.job.node.id, entry.error);
    }

    if outcome.status != ExecutionStatus::Completed {
        anyhow::bail!("execution did not complete successfully");
    }
    Ok(())
}

async fn queue_stats(database_url: &str) -> Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect(database_url)
        .await
        .context("connecting to Postgres")?;
    let queue = flowsync_core::queue::PostgresJobQueue::new(pool);
    let stats = queue.stats().await?;
    println!(
        "depth={} enqueued={} processed={} failed={}",
        stats.depth, stats.total_enqueued, stats.total_processed, stats.total_failed
    );
    Ok(())
}
