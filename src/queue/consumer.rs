/// Queue consumer
///
/// One poll loop long-polls the transport and feeds a bounded channel that
/// `concurrent_workers` tasks drain. A full channel blocks the poll loop, so
/// the transport is only asked for more work when a worker is free.
///
/// Retries are the transport's job: a message that fails (or times out) is
/// left undeleted and reappears after its visibility timeout. Execution-level
/// idempotency is therefore a precondition for handlers.

use crate::config::ConsumerConfig;
use crate::queue::{ExecutionMessage, QueueError, ReceivedMessage, Transport, MAX_BATCH_SIZE};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Processes one decoded execution message.
///
/// An `Err` leaves the message on the transport for redelivery. When the
/// invocation exceeds `process_timeout` its future is dropped and `cancel` is
/// triggered.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ExecutionMessage, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Called instead of `handle` for a message past `max_retries` that is about to be deleted.
    fn abandoned(&self, _message: &ExecutionMessage) {}
}

impl ConsumerConfig {
    /// Check ranges imposed by the transport contract.
    pub fn validate(&self) -> Result<(), QueueError> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.max_messages_per_poll) {
            return Err(QueueError::InvalidConfig(format!(
                "max_messages_per_poll must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.max_messages_per_poll
            )));
        }
        if self.wait_time > Duration::from_secs(20) {
            return Err(QueueError::InvalidConfig(format!(
                "wait_time must be at most 20s, got {:?}",
                self.wait_time
            )));
        }
        if self.concurrent_workers == 0 {
            return Err(QueueError::InvalidConfig("concurrent_workers must be at least 1".to_string()));
        }
        if self.process_timeout.is_zero() {
            return Err(QueueError::InvalidConfig("process_timeout must be positive".to_string()));
        }
        if self.visibility_timeout.is_zero() {
            return Err(QueueError::InvalidConfig("visibility_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Consumer counters
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    dead_lettered: AtomicU64,
    in_flight: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerMetricsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub dead_lettered: u64,
    pub in_flight: u64,
}

impl ConsumerMetrics {
    pub fn snapshot(&self) -> ConsumerMetricsSnapshot {
        ConsumerMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Decrements the in-flight gauge however processing ends
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct QueueConsumer {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    metrics: Arc<ConsumerMetrics>,
}

/// Per-worker view of the consumer
#[derive(Clone)]
struct Worker {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    metrics: Arc<ConsumerMetrics>,
}

impl QueueConsumer {
    pub fn new(
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Self {
            transport,
            handler,
            config,
            metrics: Arc::new(ConsumerMetrics::default()),
        })
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Poll until `shutdown` fires, then drain in-flight work and return.
    ///
    /// Shutdown never interrupts a handler that is already running.
    pub async fn run(&self, shutdown: CancellationToken) {
        let (sender, receiver) = mpsc::channel::<ReceivedMessage>(self.config.concurrent_workers);
        let receiver = Arc::new(Mutex::new(receiver));

        let worker = Worker {
            transport: Arc::clone(&self.transport),
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
        };
        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrent_workers {
            let worker = worker.clone();
            let receiver = Arc::clone(&receiver);
            workers.spawn(async move {
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(received) = next else { break };
                    worker.process(received).await;
                }
                tracing::debug!("👷 Worker {} stopped", worker_id);
            });
        }

        tracing::info!(
            "🚀 Queue consumer started ({} workers, {} messages per poll)",
            self.config.concurrent_workers,
            self.config.max_messages_per_poll
        );

        'poll: loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'poll,
                received = self.transport.receive(
                    self.config.max_messages_per_poll,
                    self.config.wait_time,
                    self.config.visibility_timeout,
                ) => received,
            };

            match received {
                Ok(batch) if !batch.is_empty() => {
                    tracing::debug!("📥 Received {} messages", batch.len());
                    for message in batch {
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => break 'poll,
                            sent = sender.send(message) => {
                                if sent.is_err() {
                                    break 'poll;
                                }
                            }
                        }
                    }
                }
                Ok(_) => self.pause(&shutdown).await,
                Err(e) => {
                    tracing::warn!("⚠️ Receive failed: {}", e);
                    self.pause(&shutdown).await;
                }
            }
        }

        tracing::info!("🛑 Shutting down queue consumer, draining workers");
        drop(sender);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("💥 Consumer worker panicked: {}", e);
            }
        }
        tracing::info!("✅ Queue consumer stopped: {:?}", self.metrics.snapshot());
    }

    async fn pause(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }
}

impl Worker {
    async fn process(&self, received: ReceivedMessage) {
        let metrics = &self.metrics;
        ConsumerMetrics::incr(&metrics.received);
        let _in_flight = InFlight::enter(&metrics.in_flight);

        let mut message = match serde_json::from_str::<ExecutionMessage>(&received.body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("⚠️ Undecodable message {}: {}", received.message_id, e);
                ConsumerMetrics::incr(&metrics.failed);
                return;
            }
        };
        message.approximate_receive_count = received.approximate_receive_count;

        if let Err(e) = message.validate() {
            tracing::warn!("⚠️ Invalid message {}: {}", received.message_id, e);
            ConsumerMetrics::incr(&metrics.failed);
            return;
        }

        if message.approximate_receive_count > self.config.max_retries {
            tracing::warn!(
                execution_id = %message.execution_id,
                "☠️ Dropping execution after {} receives (max retries {})",
                message.approximate_receive_count, self.config.max_retries
            );
            ConsumerMetrics::incr(&metrics.dead_lettered);
            self.handler.abandoned(&message);
            self.delete(&received).await;
            return;
        }

        if message.approximate_receive_count > 1 {
            tracing::warn!(execution_id = %message.execution_id, "🔁 Redelivery #{}", message.approximate_receive_count);
        }

        let execution_id = message.execution_id.clone();
        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(self.config.process_timeout, self.handler.handle(message, cancel.clone())).await;

        match outcome {
            Ok(Ok(())) => {
                ConsumerMetrics::incr(&metrics.processed);
                if self.config.delete_after_process {
                    self.delete(&received).await;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(execution_id = %execution_id, "❌ Handler failed, leaving message for redelivery: {:#}", e);
                ConsumerMetrics::incr(&metrics.failed);
            }
            Err(_) => {
                cancel.cancel();
                tracing::warn!(execution_id = %execution_id, "⏰ Handler exceeded {:?}, leaving message for redelivery",
                    self.config.process_timeout);
                ConsumerMetrics::incr(&metrics.timed_out);
                ConsumerMetrics::incr(&metrics.failed);
            }
        }
    }

    async fn delete(&self, received: &ReceivedMessage) {
        if let Err(e) = self.transport.delete(&received.receipt_handle).await {
            tracing::warn!("⚠️ Failed to delete message {}: {}", received.message_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryTransport, OutboundMessage, TriggerType};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Counts calls; optionally fails or stalls.
    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        abandoned: AtomicUsize,
        fail: bool,
        stall: Option<Duration>,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: ExecutionMessage, cancel: CancellationToken) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(stall) = self.stall {
                tokio::select! {
                    _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                    _ = tokio::time::sleep(stall) => {}
                }
            }
            if self.fail {
                anyhow::bail!("handler refused");
            }
            Ok(())
        }

        fn abandoned(&self, _message: &ExecutionMessage) {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            max_messages_per_poll: 10,
            wait_time: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(60),
            max_retries: 2,
            process_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            concurrent_workers: 2,
            delete_after_process: true,
        }
    }

    fn body() -> String {
        serde_json::to_string(&ExecutionMessage::new("wf", "t1", TriggerType::Manual, json!({}))).unwrap()
    }

    async fn enqueue(transport: &InMemoryTransport, body: String) {
        transport
            .send(OutboundMessage { body, attributes: vec![] })
            .await
            .unwrap();
    }

    /// Run the consumer until `done` holds, then shut it down.
    async fn run_until(consumer: QueueConsumer, done: impl Fn(&ConsumerMetricsSnapshot) -> bool) -> ConsumerMetricsSnapshot {
        let metrics = consumer.metrics();
        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await })
        };
        for _ in 0..1000 {
            if done(&metrics.snapshot()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();
        metrics.snapshot()
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        let mut bad = config();
        bad.max_messages_per_poll = 11;
        assert!(matches!(bad.validate(), Err(QueueError::InvalidConfig(_))));
        let mut bad = config();
        bad.wait_time = Duration::from_secs(21);
        assert!(bad.validate().is_err());
        let mut bad = config();
        bad.concurrent_workers = 0;
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_deletes_message() {
        let transport = Arc::new(InMemoryTransport::new());
        let handler = Arc::new(CountingHandler::default());
        enqueue(&transport, body()).await;
        enqueue(&transport, body()).await;

        let consumer = QueueConsumer::new(transport.clone(), handler.clone(), config()).unwrap();
        let snapshot = run_until(consumer, |m| m.processed == 2).await;

        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(transport.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_message_when_delete_after_process_is_off() {
        let transport = Arc::new(InMemoryTransport::new());
        let handler = Arc::new(CountingHandler::default());
        enqueue(&transport, body()).await;

        let mut cfg = config();
        cfg.delete_after_process = false;
        let consumer = QueueConsumer::new(transport.clone(), handler, cfg).unwrap();
        let snapshot = run_until(consumer, |m| m.processed == 1).await;

        assert_eq!(snapshot.processed, 1);
        assert_eq!(transport.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_count_over_max_retries_skips_handler() {
        let transport = Arc::new(InMemoryTransport::new());
        let handler = Arc::new(CountingHandler::default());
        enqueue(&transport, body()).await;
        // Two earlier deliveries that never completed.
        for _ in 0..2 {
            transport.receive(1, Duration::ZERO, Duration::from_millis(1)).await.unwrap();
            tokio::time::advance(Duration::from_millis(2)).await;
        }

        let consumer = QueueConsumer::new(transport.clone(), handler.clone(), config()).unwrap();
        let snapshot = run_until(consumer, |m| m.dead_lettered == 1).await;

        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(handler.abandoned.load(Ordering::SeqCst), 1);
        assert!(transport.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_and_decode_error_leave_message() {
        let transport = Arc::new(InMemoryTransport::new());
        let handler = Arc::new(CountingHandler { fail: true, ..Default::default() });
        enqueue(&transport, body()).await;
        enqueue(&transport, "{not json".to_string()).await;

        let consumer = QueueConsumer::new(transport.clone(), handler.clone(), config()).unwrap();
        let snapshot = run_until(consumer, |m| m.failed == 2).await;

        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.processed, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let transport = Arc::new(InMemoryTransport::new());
        let handler = Arc::new(CountingHandler {
            stall: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        enqueue(&transport, body()).await;

        let mut cfg = config();
        cfg.process_timeout = Duration::from_secs(1);
        let consumer = QueueConsumer::new(transport.clone(), handler.clone(), cfg).unwrap();
        let snapshot = run_until(consumer, |m| m.timed_out == 1).await;

        assert_eq!(snapshot.timed_out, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.processed, 0);
        assert_eq!(transport.len(), 1);
    }
}
