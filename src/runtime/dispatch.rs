/// Execution dispatch: the queue handler that runs workflows
///
/// Turns an `ExecutionMessage` into a graph execution and tracks every
/// execution's state in an in-memory ledger. Failed executions are handed back
/// to the consumer as errors so the transport redelivers the message; the
/// attempt that reaches `max_retries` is recorded as terminal, even when the
/// consumer times it out.

use crate::queue::{ExecutionMessage, MessageHandler};
use crate::runtime::engine::{ExecutionEngine, ExecutionStatus};
use crate::workflow::{ErrorClassification, ErrorHandlingMetadata, ExecutionEnv, ExecutionError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Running,
    Succeeded,
    Failed,
}

/// Ledger entry for one execution ID
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub tenant_id: String,
    pub status: RecordStatus,
    /// Deliveries seen so far
    pub attempts: u32,
    /// No further redelivery will be attempted
    pub terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorHandlingMetadata>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    #[serde(skip)]
    finish_seq: u64,
}

impl ExecutionRecord {
    fn running(message: &ExecutionMessage, attempt: u32) -> Self {
        Self {
            execution_id: message.execution_id.clone(),
            workflow_id: message.workflow_id.clone(),
            tenant_id: message.tenant_id.clone(),
            status: RecordStatus::Running,
            attempts: attempt,
            terminal: false,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            finish_seq: 0,
        }
    }
}

/// Concurrent map of execution records keyed by execution ID
///
/// With a capacity, finished records beyond it are evicted oldest first.
/// Running records are never evicted.
#[derive(Debug, Default)]
pub struct ExecutionLedger {
    records: DashMap<String, ExecutionRecord>,
    capacity: Option<usize>,
    finished: AtomicU64,
}

impl ExecutionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::default()
        }
    }

    fn start(&self, message: &ExecutionMessage, attempt: u32) {
        self.records
            .entry(message.execution_id.clone())
            .and_modify(|record| {
                record.status = RecordStatus::Running;
                record.attempts = attempt.max(record.attempts + 1);
                record.started_at = Utc::now();
                record.finished_at = None;
            })
            .or_insert_with(|| ExecutionRecord::running(message, attempt));
    }

    fn finish(&self, execution_id: &str, result: Result<Value, ErrorHandlingMetadata>, terminal: bool, duration_ms: u64) {
        if let Some(mut record) = self.records.get_mut(execution_id) {
            match result {
                Ok(output) => {
                    record.status = RecordStatus::Succeeded;
                    record.output = Some(output);
                    record.error = None;
                }
                Err(error) => {
                    record.status = RecordStatus::Failed;
                    record.error = Some(error);
                }
            }
            record.terminal = terminal;
            record.finished_at = Some(Utc::now());
            record.duration_ms = duration_ms;
            record.finish_seq = self.finished.fetch_add(1, Ordering::Relaxed);
        }
        self.evict();
    }

    /// Mark an execution failed for good without running it again.
    fn abandon(&self, message: &ExecutionMessage) {
        {
            let mut record = self
                .records
                .entry(message.execution_id.clone())
                .or_insert_with(|| ExecutionRecord::running(message, message.approximate_receive_count));
            if record.terminal {
                return;
            }
            record.status = RecordStatus::Failed;
            record.terminal = true;
            record.attempts = record.attempts.max(message.approximate_receive_count);
            if record.error.is_none() {
                record.error = Some(ErrorHandlingMetadata {
                    error_type: "RetriesExhausted".to_string(),
                    error_message: format!("gave up after {} deliveries", message.approximate_receive_count),
                    classification: ErrorClassification::Permanent,
                    node_id: String::new(),
                    node_type: "workflow".to_string(),
                    occurred_at: Utc::now(),
                });
            }
            record.finished_at = Some(Utc::now());
            record.finish_seq = self.finished.fetch_add(1, Ordering::Relaxed);
        }
        self.evict();
    }

    fn evict(&self) {
        let Some(capacity) = self.capacity else { return };
        let excess = self.records.len().saturating_sub(capacity);
        if excess == 0 {
            return;
        }
        let mut finished: Vec<(u64, String)> = self
            .records
            .iter()
            .filter(|record| record.status != RecordStatus::Running)
            .map(|record| (record.finish_seq, record.execution_id.clone()))
            .collect();
        finished.sort_unstable();
        for (_, execution_id) in finished.into_iter().take(excess) {
            self.records
                .remove_if(&execution_id, |_, record| record.status != RecordStatus::Running);
        }
        tracing::debug!("🧹 Ledger trimmed to {} records", self.records.len());
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.records.get(execution_id).map(|record| record.clone())
    }

    pub fn count(&self, status: RecordStatus) -> usize {
        self.records.iter().filter(|record| record.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Records a timeout failure if `handle` is dropped before it finishes.
struct Attempt<'a> {
    ledger: &'a ExecutionLedger,
    execution_id: String,
    last_attempt: bool,
    started: Instant,
    recorded: bool,
}

impl Attempt<'_> {
    fn finish(mut self, result: Result<Value, ErrorHandlingMetadata>, terminal: bool, duration_ms: u64) {
        self.recorded = true;
        self.ledger.finish(&self.execution_id, result, terminal, duration_ms);
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        tracing::warn!(execution_id = %self.execution_id, "⏰ Execution abandoned before it finished");
        let error = ErrorHandlingMetadata {
            error_type: "Timeout".to_string(),
            error_message: "execution abandoned before it finished".to_string(),
            classification: ErrorClassification::Timeout,
            node_id: String::new(),
            node_type: "workflow".to_string(),
            occurred_at: Utc::now(),
        };
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.ledger.finish(&self.execution_id, Err(error), self.last_attempt, elapsed);
    }
}

pub struct ExecutionDispatcher {
    engine: ExecutionEngine,
    ledger: Arc<ExecutionLedger>,
    max_retries: u32,
}

impl ExecutionDispatcher {
    pub fn new(engine: ExecutionEngine, ledger: Arc<ExecutionLedger>, max_retries: u32) -> Self {
        Self {
            engine,
            ledger,
            max_retries,
        }
    }

    pub fn ledger(&self) -> &Arc<ExecutionLedger> {
        &self.ledger
    }
}

#[async_trait]
impl MessageHandler for ExecutionDispatcher {
    async fn handle(&self, message: ExecutionMessage, cancel: CancellationToken) -> anyhow::Result<()> {
        let attempt_number = message.approximate_receive_count.max(1);
        let last_attempt = attempt_number >= self.max_retries;
        self.ledger.start(&message, attempt_number);
        let attempt = Attempt {
            ledger: &self.ledger,
            execution_id: message.execution_id.clone(),
            last_attempt,
            started: Instant::now(),
            recorded: false,
        };

        let env = ExecutionEnv {
            tenant_id: message.tenant_id.clone(),
            execution_id: message.execution_id.clone(),
            workflow_id: message.workflow_id.clone(),
            parent_workflow_id: None,
            trigger_type: message.trigger_type.to_string(),
        };

        let outcome = match self
            .engine
            .execute(&message.workflow_id, message.trigger_data.clone(), env, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e @ ExecutionError::WorkflowNotFound(_)) => {
                // Redelivery cannot make an unknown workflow appear for this tenant.
                tracing::error!(execution_id = %message.execution_id, "❌ {}", e);
                let metadata = ErrorHandlingMetadata::from_error(&e, "", "workflow");
                attempt.finish(Err(metadata), true, 0);
                return Ok(());
            }
            Err(e) => {
                let metadata = ErrorHandlingMetadata::from_error(&e, "", "workflow");
                attempt.finish(Err(metadata), last_attempt, 0);
                return Err(e.into());
            }
        };

        match outcome.status {
            ExecutionStatus::Succeeded => {
                attempt.finish(Ok(outcome.output), true, outcome.duration_ms);
                Ok(())
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| ErrorHandlingMetadata::from_error(&ExecutionError::Cancelled, "", "workflow"));
                let retryable = error.classification != ErrorClassification::Validation;
                let terminal = last_attempt || !retryable;
                let summary = format!("{}: {}", error.error_type, error.error_message);

                if terminal {
                    tracing::error!(
                        execution_id = %message.execution_id,
                        "💀 Execution failed for good after attempt {}: {}",
                        attempt_number, summary
                    );
                } else {
                    tracing::warn!(
                        execution_id = %message.execution_id,
                        "🔁 Attempt {} failed, will retry: {}",
                        attempt_number, summary
                    );
                }
                attempt.finish(Err(error), terminal, outcome.duration_ms);

                if retryable {
                    anyhow::bail!("execution {} failed: {}", message.execution_id, summary)
                }
                Ok(())
            }
        }
    }

    fn abandoned(&self, message: &ExecutionMessage) {
        tracing::error!(
            execution_id = %message.execution_id,
            "💀 Execution abandoned after {} deliveries",
            message.approximate_receive_count
        );
        self.ledger.abandon(message);
    }
}
