//! Broker client error types.

use thiserror::Error;

use synergy_core::error::DomainError;

/// Errors raised by the event bus and its transports.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker could not be reached or the session dropped.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The client is not connected; call `connect()` first.
    #[error("event bus is not connected")]
    NotConnected,

    /// Reconnection attempts were exhausted. Surfaces until `connect()`
    /// succeeds again.
    #[error("event bus failed after {attempts} reconnect attempts")]
    Failed {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The broker rejected or failed to acknowledge a record.
    #[error("publish to {topic} failed: {reason}")]
    Publish {
        /// Target topic.
        topic: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// No acknowledgement arrived within the publish timeout.
    #[error("timed out waiting for acknowledgement from {topic}")]
    Timeout {
        /// Target topic.
        topic: String,
    },

    /// Joining a consumer group or committing an offset failed.
    #[error("subscription failed: {0}")]
    Subscribe(String),

    /// The session or channel was closed locally.
    #[error("channel closed")]
    ChannelClosed,

    /// An envelope could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Reading the event store failed.
    #[error("event store error: {0}")]
    Store(#[from] DomainError),
}

impl BusError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout { .. } | Self::Publish { .. } | Self::ChannelClosed => {
                true
            }
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the error means the session is gone.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ChannelClosed)
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for BusError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError;
        match &err {
            KafkaError::ClientCreation(_) | KafkaError::MetadataFetch(_) => {
                Self::Connection(err.to_string())
            }
            KafkaError::Subscription(_) | KafkaError::ConsumerCommit(_) => {
                Self::Subscribe(err.to_string())
            }
            _ => Self::Connection(err.to_string()),
        }
    }
}
