//! Event store abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::EventMetadata;
use crate::snapshot::SnapshotStore;

/// Length of a hyphenated UUID.
const UUID_LEN: usize = 36;

/// Builds a stream identifier following the `<aggregateType>-<uuid>` convention.
#[must_use]
pub fn stream_id(aggregate_type: &str, aggregate_id: Uuid) -> String {
    format!("{aggregate_type}-{aggregate_id}")
}

/// Returns the aggregate type part of a stream identifier.
///
/// Streams that do not follow the convention are their own category.
#[must_use]
pub fn stream_category(stream_id: &str) -> &str {
    let Some(split) = stream_id.len().checked_sub(UUID_LEN + 1) else {
        return stream_id;
    };
    match (stream_id.get(..split), stream_id.get(split..)) {
        (Some(category), Some(rest))
            if !category.is_empty()
                && rest.starts_with('-')
                && Uuid::parse_str(&rest[1..]).is_ok() =>
        {
            category
        }
        _ => stream_id,
    }
}

/// An event ready to be appended. The store assigns version and position.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Correlation/causation metadata.
    pub metadata: EventMetadata,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    /// Turns this event into its persisted form.
    #[must_use]
    pub fn into_stored(self, stream_id: &str, version: i64, position: i64) -> StoredEvent {
        StoredEvent {
            id: self.id,
            stream_id: stream_id.to_owned(),
            event_type: self.event_type,
            aggregate_id: self.aggregate_id,
            version,
            position,
            payload: self.payload,
            metadata: self.metadata,
            occurred_at: self.occurred_at,
        }
    }
}

/// Stored representation of a domain event. Also the broker wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// Stream this event belongs to.
    pub stream_id: String,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Version within the stream, starting at 1.
    pub version: i64,
    /// Position in the global log.
    pub position: i64,
    /// Serialized event payload.
    #[serde(rename = "eventData")]
    pub payload: serde_json::Value,
    /// Correlation/causation metadata.
    pub metadata: EventMetadata,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Returns the aggregate type derived from the stream identifier.
    #[must_use]
    pub fn aggregate_type(&self) -> &str {
        stream_category(&self.stream_id)
    }
}

/// Store trait for appending and reading domain events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` to `stream_id` if its current length equals
    /// `expected_version`. All or nothing.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` on a version mismatch and
    /// `DomainError::StorageUnavailable` when the backend is unreachable.
    async fn save_events(
        &self,
        stream_id: &str,
        events: Vec<NewEvent>,
        expected_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Loads events of a stream with `version >= from_version`, ascending.
    async fn get_events(
        &self,
        stream_id: &str,
        from_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Scans the global log from `from_position` (inclusive), ascending.
    async fn get_all_events(
        &self,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Reads at most `limit` events of the global log from `from_position`
    /// (inclusive), ascending. Cursor-driven readers page through the log
    /// with this instead of `get_all_events`.
    async fn read_all(
        &self,
        from_position: i64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Scans the global log for one event type from `from_position`.
    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Returns the current length of a stream (0 when absent).
    async fn stream_version(&self, stream_id: &str) -> Result<i64, DomainError>;
}

/// Snapshot to persist alongside a batch of events.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSnapshot {
    /// Aggregate the snapshot belongs to.
    pub aggregate_id: Uuid,
    /// Stream version the state reflects.
    pub version: i64,
    /// Serialized aggregate state.
    pub data: serde_json::Value,
}

/// A unit of work written by `Repository::save`.
#[derive(Debug, Clone)]
pub struct Commit {
    /// Target stream.
    pub stream_id: String,
    /// Length the stream must have for the commit to succeed.
    pub expected_version: i64,
    /// Events to append.
    pub events: Vec<NewEvent>,
    /// Snapshot to upsert in the same transaction, if any.
    pub snapshot: Option<PendingSnapshot>,
}

/// Backend able to persist a snapshot and an event batch atomically.
#[async_trait]
pub trait AggregateStore: EventStore + SnapshotStore {
    /// Writes `commit` in a single transaction: either the snapshot and all
    /// events become visible, or nothing does.
    ///
    /// # Errors
    ///
    /// Same as [`EventStore::save_events`].
    async fn commit(&self, commit: Commit) -> Result<Vec<StoredEvent>, DomainError>;
}
