/// Worker setup and initialization
///
/// Wires together all components: registry, execution engine, transport,
/// publisher, consumer and dispatcher. `start_worker` runs the whole pipeline
/// until Ctrl-C, publishing execution requests read as JSON lines from stdin.

use crate::{
    config::Config,
    expression::Evaluator,
    queue::{ExecutionMessage, InMemoryTransport, QueueConsumer, QueuePublisher, TriggerType},
    runtime::{ExecutionDispatcher, ExecutionEngine, ExecutionLedger, RecordStatus},
    workflow::WorkflowRegistry,
};
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::{path::Path, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// All long-lived worker components
pub struct Worker {
    pub registry: Arc<WorkflowRegistry>,
    pub engine: ExecutionEngine,
    pub transport: Arc<InMemoryTransport>,
    pub publisher: Arc<QueuePublisher>,
    pub consumer: QueueConsumer,
    pub ledger: Arc<ExecutionLedger>,
}

/// One stdin line: an execution request, execution ID optional
#[derive(Debug, Deserialize)]
struct ExecutionRequest {
    #[serde(default)]
    execution_id: Option<String>,
    workflow_id: String,
    tenant_id: String,
    #[serde(default = "default_trigger_type")]
    trigger_type: TriggerType,
    #[serde(default)]
    trigger_data: Value,
}

fn default_trigger_type() -> TriggerType {
    TriggerType::Manual
}

impl From<ExecutionRequest> for ExecutionMessage {
    fn from(request: ExecutionRequest) -> Self {
        let mut message = ExecutionMessage::new(
            request.workflow_id,
            request.tenant_id,
            request.trigger_type,
            request.trigger_data,
        );
        if let Some(execution_id) = request.execution_id {
            message.execution_id = execution_id;
        }
        message
    }
}

/// Build every worker component from `config`
///
/// Loads the workflow directory when it exists; a missing directory leaves the
/// registry empty.
pub async fn build_worker(config: &Config) -> Result<Worker> {
    tracing::info!("📊 Initializing workflow registry");
    let evaluator = Arc::new(Evaluator::new());
    let registry = Arc::new(WorkflowRegistry::new(Arc::clone(&evaluator)));

    let workflows_dir = Path::new(&config.worker.workflows_dir);
    if workflows_dir.is_dir() {
        tracing::info!("📥 Loading workflows from {}", workflows_dir.display());
        let loaded = registry.load_dir(workflows_dir).await?;
        tracing::info!("📚 Loaded {} workflows", loaded);
    } else {
        tracing::warn!("⚠️ Workflows directory {} not found, starting empty", workflows_dir.display());
    }

    tracing::info!("🚀 Initializing execution engine");
    let engine = ExecutionEngine::from_config(Arc::clone(&registry), evaluator, config.engine.clone())
        .context("Failed to initialize execution engine")?;

    tracing::info!("📮 Initializing in-memory transport '{}'", config.worker.queue_name);
    let transport = Arc::new(InMemoryTransport::with_dead_letter(config.worker.dead_letter_after));
    let publisher = Arc::new(QueuePublisher::new(transport.clone(), config.worker.queue_name.clone()));

    let ledger = Arc::new(ExecutionLedger::with_capacity(config.worker.ledger_capacity));
    let dispatcher = Arc::new(ExecutionDispatcher::new(
        engine.clone(),
        Arc::clone(&ledger),
        config.consumer.max_retries,
    ));
    let consumer = QueueConsumer::new(transport.clone(), dispatcher, config.consumer.clone())
        .context("Invalid consumer configuration")?;

    tracing::info!("✅ Worker initialized successfully");
    Ok(Worker {
        registry,
        engine,
        transport,
        publisher,
        consumer,
        ledger,
    })
}

/// Publish each JSON line read from `input` as an execution message.
pub async fn publish_lines<R>(publisher: &QueuePublisher, input: R) -> Result<usize>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut published = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: ExecutionRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("⚠️ Skipping malformed execution request: {}", e);
                continue;
            }
        };
        match publisher.publish_execution(&request.into()).await {
            Ok(_) => published += 1,
            Err(e) => tracing::warn!("⚠️ Execution request rejected: {}", e),
        }
    }
    Ok(published)
}

/// Start the worker with the given configuration
pub async fn start_worker(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Flowline worker...");
    let worker = build_worker(&config).await?;
    let shutdown = CancellationToken::new();

    let publisher = Arc::clone(&worker.publisher);
    let stdin_task = tokio::spawn(async move {
        match publish_lines(&publisher, BufReader::new(tokio::io::stdin())).await {
            Ok(count) => tracing::info!("📭 Stdin closed after {} execution requests", count),
            Err(e) => tracing::error!("❌ Failed reading execution requests: {}", e),
        }
    });

    let consumer_shutdown = shutdown.clone();
    let consumer = worker.consumer;
    let consumer_task = tokio::spawn(async move { consumer.run(consumer_shutdown).await });

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!("🛑 Ctrl-C received, shutting down");
    stdin_task.abort();
    shutdown.cancel();
    consumer_task.await.context("Consumer task failed")?;

    tracing::info!(
        "📋 Executions: {} succeeded, {} failed, {} running; {} messages left, {} dead-lettered",
        worker.ledger.count(RecordStatus::Succeeded),
        worker.ledger.count(RecordStatus::Failed),
        worker.ledger.count(RecordStatus::Running),
        worker.transport.len(),
        worker.transport.dead_letters().len(),
    );
    Ok(())
}
