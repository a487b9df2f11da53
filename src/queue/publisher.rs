/// Queue publisher
///
/// Serializes execution messages and hands them to the transport, keeping
/// simple success/failure counters for observability.

use crate::queue::{ExecutionMessage, OutboundMessage, QueueError, Transport, MAX_BATCH_SIZE};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Publish counters, updated concurrently by every caller
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    published: AtomicU64,
    failed: AtomicU64,
    last_published_at: ArcSwapOption<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublisherMetricsSnapshot {
    pub published: u64,
    pub failed: u64,
    pub last_published_at: Option<DateTime<Utc>>,
}

impl PublisherMetrics {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn last_published_at(&self) -> Option<DateTime<Utc>> {
        self.last_published_at.load_full().map(|at| *at)
    }

    pub fn snapshot(&self) -> PublisherMetricsSnapshot {
        PublisherMetricsSnapshot {
            published: self.published(),
            failed: self.failed(),
            last_published_at: self.last_published_at(),
        }
    }

    fn record_published(&self, count: u64) {
        self.published.fetch_add(count, Ordering::Relaxed);
        self.last_published_at.store(Some(Arc::new(Utc::now())));
    }

    fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }
}

pub struct QueuePublisher {
    transport: Arc<dyn Transport>,
    queue_name: String,
    metrics: PublisherMetrics,
}

impl QueuePublisher {
    pub fn new(transport: Arc<dyn Transport>, queue_name: impl Into<String>) -> Self {
        Self {
            transport,
            queue_name: queue_name.into(),
            metrics: PublisherMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &PublisherMetrics {
        &self.metrics
    }

    /// Validate, serialize and send one execution message.
    pub async fn publish_execution(&self, message: &ExecutionMessage) -> Result<String, QueueError> {
        let outbound = encode(message)?;

        match self.transport.send(outbound).await {
            Ok(message_id) => {
                self.metrics.record_published(1);
                tracing::info!(
                    execution_id = %message.execution_id,
                    workflow_id = %message.workflow_id,
                    tenant_id = %message.tenant_id,
                    "📤 Published execution to '{}' (message {})",
                    self.queue_name, message_id
                );
                Ok(message_id)
            }
            Err(e) => {
                self.metrics.record_failed(1);
                tracing::error!(execution_id = %message.execution_id, "❌ Failed to publish execution: {}", e);
                Err(QueueError::Transport(e))
            }
        }
    }

    /// Send up to ten messages in one transport call.
    ///
    /// Every message is validated and serialized before anything is sent, so
    /// one bad message fails the whole batch with nothing published.
    pub async fn publish_execution_batch(&self, messages: &[ExecutionMessage]) -> Result<Vec<String>, QueueError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        if messages.len() > MAX_BATCH_SIZE {
            return Err(QueueError::BatchTooLarge {
                size: messages.len(),
                max: MAX_BATCH_SIZE,
            });
        }

        let outbound = messages.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
        let count = outbound.len() as u64;

        match self.transport.send_batch(outbound).await {
            Ok(ids) => {
                self.metrics.record_published(count);
                tracing::info!("📤 Published batch of {} executions to '{}'", count, self.queue_name);
                Ok(ids)
            }
            Err(e) => {
                self.metrics.record_failed(count);
                tracing::error!("❌ Failed to publish batch of {} executions: {}", count, e);
                Err(QueueError::Transport(e))
            }
        }
    }
}

fn encode(message: &ExecutionMessage) -> Result<OutboundMessage, QueueError> {
    message.validate()?;
    Ok(OutboundMessage {
        body: serde_json::to_string(message)?,
        attributes: message.attributes(),
    })
}
