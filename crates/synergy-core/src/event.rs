//! Domain event abstractions.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::event_store::{NewEvent, StoredEvent};

/// Metadata attached to every domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Correlation ID for tracing a command through its effects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Causation ID linking this event to the event/command that caused it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    /// Component that produced the event.
    pub source: String,
    /// Additional free-form entries, flattened into the metadata object.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EventMetadata {
    /// Creates metadata for events produced by `source`.
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            causation_id: None,
            source: source.into(),
            extra: serde_json::Map::new(),
        }
    }

    /// Sets the correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the causation ID.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Adds a free-form entry.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Trait implemented by each aggregate's event enum.
///
/// The enum is the tagged variant; `event_type` is its discriminator on the
/// wire. `decode` must reject unknown types with
/// [`DomainError::UnknownEventType`].
pub trait AggregateEvent: Clone + std::fmt::Debug + Send + Sync + Sized {
    /// Returns the event type name (used for serialization routing).
    fn event_type(&self) -> &'static str;

    /// Serializes the variant's payload (without the tag).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload cannot be encoded.
    fn encode(&self) -> Result<serde_json::Value, DomainError>;

    /// Rebuilds the variant named by `event_type` from its payload.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnknownEventType` for unrecognized types and
    /// `DomainError::Serialization` for undecodable payloads.
    fn decode(event_type: &str, payload: serde_json::Value) -> Result<Self, DomainError>;
}

/// Encodes a variant payload, for use in `AggregateEvent::encode`.
///
/// # Errors
///
/// Returns `DomainError::Serialization` if serialization fails.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<serde_json::Value, DomainError> {
    serde_json::to_value(payload).map_err(DomainError::from)
}

/// Decodes a variant payload, for use in `AggregateEvent::decode`.
///
/// # Errors
///
/// Returns `DomainError::Serialization` naming the event type on failure.
pub fn decode_payload<T: DeserializeOwned>(
    event_type: &str,
    payload: serde_json::Value,
) -> Result<T, DomainError> {
    serde_json::from_value(payload)
        .map_err(|e| DomainError::Serialization(format!("{event_type}: {e}")))
}

/// A domain event raised by an aggregate, typed by the aggregate's event enum.
#[derive(Debug, Clone)]
pub struct DomainEvent<E> {
    /// Unique event identifier.
    pub id: Uuid,
    /// Aggregate this event belongs to.
    pub aggregate_id: Uuid,
    /// Stream version this event occupies.
    pub aggregate_version: i64,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
    /// Correlation/causation metadata.
    pub metadata: EventMetadata,
    /// Event-specific payload.
    pub payload: E,
}

impl<E: AggregateEvent> DomainEvent<E> {
    /// Returns the event type of the payload.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// Converts into the untyped form accepted by the event store.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload cannot be encoded.
    pub fn to_new_event(&self) -> Result<NewEvent, DomainError> {
        Ok(NewEvent {
            id: self.id,
            event_type: self.event_type().to_owned(),
            aggregate_id: self.aggregate_id,
            payload: self.payload.encode()?,
            metadata: self.metadata.clone(),
            occurred_at: self.occurred_at,
        })
    }

    /// Decodes a stored event into its typed form.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnknownEventType` or `DomainError::Serialization`
    /// when the stored event cannot be decoded. Callers must not skip it.
    pub fn from_stored(stored: &StoredEvent) -> Result<Self, DomainError> {
        let payload = E::decode(&stored.event_type, stored.payload.clone())?;
        Ok(Self {
            id: stored.id,
            aggregate_id: stored.aggregate_id,
            aggregate_version: stored.version,
            occurred_at: stored.occurred_at,
            metadata: stored.metadata.clone(),
            payload,
        })
    }
}
