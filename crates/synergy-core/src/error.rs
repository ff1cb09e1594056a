//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An aggregate was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    /// Optimistic concurrency conflict. The caller reloads the aggregate,
    /// reapplies the command and saves again.
    #[error("concurrency conflict on stream {stream_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The stream that had the conflict.
        stream_id: String,
        /// The expected version.
        expected: i64,
        /// The actual version found.
        actual: i64,
    },

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// A command was issued against an aggregate in a terminal state.
    #[error("aggregate {0} is in a terminal state")]
    AggregateTerminated(Uuid),

    /// A stored event carries a type the aggregate does not know.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// A stream violates the version contract (gap, duplicate, wrong id).
    #[error("stream corrupted: {0}")]
    StreamCorrupted(String),

    /// A payload or snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The storage backend is temporarily unreachable.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Any other infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Whether a surrounding resilience layer may retry the same call.
    ///
    /// Conflicts are not retryable at this level: the whole command has to be
    /// re-executed against freshly loaded state.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    /// Whether this is an optimistic concurrency conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
