/// Transport abstraction and the in-memory queue used by the worker binary
///
/// The contract mirrors a hosted message queue: long-poll receive bounded by
/// a message count and wait time, single and batched send, delete by receipt
/// handle, and a per-message approximate receive count maintained by the
/// transport itself.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::queue::MAX_BATCH_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("unknown or stale receipt handle: {0}")]
    ReceiptHandleNotFound(String),

    #[error("batch of {0} entries exceeds the transport limit")]
    BatchTooLarge(usize),
}

/// A message on its way to the transport
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub body: String,
    pub attributes: Vec<(String, String)>,
}

/// A message handed out by `receive`
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Valid until the message is received again
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
    pub approximate_receive_count: u32,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue one message and return its transport ID.
    async fn send(&self, message: OutboundMessage) -> Result<String, TransportError>;

    /// Enqueue up to ten messages in one call.
    async fn send_batch(&self, messages: Vec<OutboundMessage>) -> Result<Vec<String>, TransportError>;

    /// Long-poll for up to `max_messages`, waiting at most `wait` for the first.
    /// Returned messages stay hidden from other receivers for `visibility_timeout`.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, TransportError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), TransportError>;
}

struct StoredMessage {
    message_id: String,
    body: String,
    attributes: HashMap<String, String>,
    receive_count: u32,
    visible_at: Instant,
    receipt_handle: Option<String>,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    dead_letters: Vec<StoredMessage>,
    deleted: usize,
}

/// FIFO in-process queue with visibility timeouts and dead-letter redrive
///
/// A message that has already been received `max_receive_count` times is
/// moved to the dead-letter list instead of being delivered again.
pub struct InMemoryTransport {
    state: Mutex<QueueState>,
    arrivals: Notify,
    max_receive_count: Option<u32>,
    send_calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryTransport {
    /// Queue without dead-letter redrive
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
            max_receive_count: None,
            send_calls: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Queue that dead-letters messages after `max_receive_count` receives
    pub fn with_dead_letter(max_receive_count: u32) -> Self {
        Self {
            max_receive_count: Some(max_receive_count.max(1)),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("in-memory transport switched off".to_string()));
        }
        Ok(())
    }

    fn enqueue(&self, message: OutboundMessage) -> String {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.lock().messages.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: message.body,
            attributes: message.attributes.into_iter().collect(),
            receive_count: 0,
            visible_at: Instant::now(),
            receipt_handle: None,
        });
        message_id
    }

    /// Hand out visible messages; also reports when the next hidden one reappears.
    fn take_visible(&self, max_messages: usize, visibility_timeout: Duration) -> (Vec<ReceivedMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut state = self.lock();
        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;
        let mut index = 0;

        while index < state.messages.len() && batch.len() < max_messages {
            let visible_at = state.messages[index].visible_at;
            if visible_at > now {
                next_visible = Some(next_visible.map_or(visible_at, |at| at.min(visible_at)));
                index += 1;
                continue;
            }

            let exhausted = self
                .max_receive_count
                .is_some_and(|limit| state.messages[index].receive_count >= limit);
            if exhausted {
                if let Some(dead) = state.messages.remove(index) {
                    tracing::warn!("☠️ Message {} moved to dead-letter list after {} receives",
                        dead.message_id, dead.receive_count);
                    state.dead_letters.push(dead);
                }
                continue;
            }

            let stored = &mut state.messages[index];
            let receipt_handle = uuid::Uuid::new_v4().to_string();
            stored.receive_count += 1;
            stored.visible_at = now + visibility_timeout;
            stored.receipt_handle = Some(receipt_handle.clone());
            batch.push(ReceivedMessage {
                message_id: stored.message_id.clone(),
                receipt_handle,
                body: stored.body.clone(),
                attributes: stored.attributes.clone(),
                approximate_receive_count: stored.receive_count,
            });
            index += 1;
        }

        (batch, next_visible)
    }

    /// Messages still owned by the queue, hidden or not
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies of dead-lettered messages, oldest first
    pub fn dead_letters(&self) -> Vec<String> {
        self.lock().dead_letters.iter().map(|m| m.body.clone()).collect()
    }

    pub fn deleted_count(&self) -> usize {
        self.lock().deleted
    }

    /// Number of `send` plus `send_batch` calls, failed ones included
    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with `Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, message: OutboundMessage) -> Result<String, TransportError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let message_id = self.enqueue(message);
        self.arrivals.notify_waiters();
        Ok(message_id)
    }

    async fn send_batch(&self, messages: Vec<OutboundMessage>) -> Result<Vec<String>, TransportError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if messages.len() > MAX_BATCH_SIZE {
            return Err(TransportError::BatchTooLarge(messages.len()));
        }
        let ids = messages.into_iter().map(|m| self.enqueue(m)).collect();
        self.arrivals.notify_waiters();
        Ok(ids)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        self.check_available()?;
        let deadline = Instant::now() + wait;

        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let (batch, next_visible) = self.take_visible(max_messages, visibility_timeout);
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), TransportError> {
        self.check_available()?;
        let mut state = self.lock();
        let position = state
            .messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| TransportError::ReceiptHandleNotFound(receipt_handle.to_string()))?;
        state.messages.remove(position);
        state.deleted += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn outbound(body: &str) -> OutboundMessage {
        OutboundMessage {
            body: body.to_string(),
            attributes: vec![("tenant_id".to_string(), "t1".to_string())],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_and_receive_count() {
        let transport = InMemoryTransport::new();
        transport.send(outbound("one")).await.unwrap();

        let first = transport.receive(10, Duration::ZERO, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].approximate_receive_count, 1);
        assert_eq!(first[0].attributes["tenant_id"], "t1");

        let hidden = transport.receive(10, Duration::ZERO, Duration::from_secs(30)).await.unwrap();
        assert!(hidden.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let again = transport.receive(10, Duration::ZERO, Duration::from_secs(30)).await.unwrap();
        assert_eq!(again[0].approximate_receive_count, 2);

        // The first receipt handle went stale on redelivery.
        assert!(transport.delete(&first[0].receipt_handle).await.is_err());
        transport.delete(&again[0].receipt_handle).await.unwrap();
        assert!(transport.is_empty());
        assert_eq!(transport.deleted_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let transport = Arc::new(InMemoryTransport::new());
        let receiver = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.receive(1, Duration::from_secs(20), Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        transport.send(outbound("late")).await.unwrap();

        let received = receiver.await.unwrap().unwrap();
        assert_eq!(received[0].body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_returns_empty_after_wait() {
        let transport = InMemoryTransport::new();
        let started = Instant::now();
        let received = transport.receive(1, Duration::from_secs(5), Duration::from_secs(30)).await.unwrap();
        assert!(received.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_redrive() {
        let transport = InMemoryTransport::with_dead_letter(2);
        transport.send(outbound("poison")).await.unwrap();

        for _ in 0..2 {
            let batch = transport.receive(1, Duration::ZERO, Duration::ZERO).await.unwrap();
            assert_eq!(batch.len(), 1);
        }
        let batch = transport.receive(1, Duration::ZERO, Duration::ZERO).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(transport.dead_letters(), vec!["poison".to_string()]);
        assert!(transport.is_empty());
    }

    #[tokio::test]
    async fn test_batch_limit_and_outage() {
        let transport = InMemoryTransport::new();
        let eleven = (0..11).map(|i| outbound(&i.to_string())).collect();
        assert!(matches!(transport.send_batch(eleven).await, Err(TransportError::BatchTooLarge(11))));

        transport.set_unavailable(true);
        assert!(transport.send(outbound("x")).await.is_err());
        assert_eq!(transport.send_calls(), 2);
        assert!(transport.is_empty());
    }
}
