/// Queue-driven dispatch pipeline
///
/// Executions are published as JSON messages onto a transport and picked up
/// by a consumer that hands them to a bounded pool of workers. Delivery is
/// at-least-once: a failed message is simply left on the transport and comes
/// back once its visibility timeout lapses.

pub mod consumer;
pub mod message;
pub mod publisher;
pub mod transport;

pub use consumer::{ConsumerMetrics, ConsumerMetricsSnapshot, MessageHandler, QueueConsumer};
pub use message::{ExecutionMessage, TriggerType};
pub use publisher::{PublisherMetrics, PublisherMetricsSnapshot, QueuePublisher};
pub use transport::{InMemoryTransport, OutboundMessage, ReceivedMessage, Transport, TransportError};

/// Hard per-call batch ceiling imposed by the transport contract
pub const MAX_BATCH_SIZE: usize = 10;

/// Errors raised by the publisher, the consumer and message validation
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("invalid execution message: {0}")]
    InvalidMessage(String),

    #[error("batch of {size} messages exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("invalid consumer configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
