//! Aggregate root abstraction.

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DomainError;
use crate::event::{AggregateEvent, DomainEvent, EventMetadata};
use crate::event_store::stream_id;

/// Bookkeeping every aggregate embeds: identity, version and the events
/// raised since the last save.
#[derive(Debug, Clone)]
pub struct AggregateRoot<E> {
    id: Uuid,
    version: i64,
    uncommitted_events: Vec<DomainEvent<E>>,
}

impl<E> AggregateRoot<E> {
    /// Creates the root of a new aggregate (version 0).
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self::at_version(id, 0)
    }

    /// Creates the root of an aggregate restored at `version`.
    #[must_use]
    pub fn at_version(id: Uuid, version: i64) -> Self {
        Self {
            id,
            version,
            uncommitted_events: Vec::new(),
        }
    }

    /// Returns the aggregate identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the current version (number of events applied).
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Returns the events raised since the last save.
    #[must_use]
    pub fn uncommitted_events(&self) -> &[DomainEvent<E>] {
        &self.uncommitted_events
    }
}

/// Trait for aggregate roots that reconstitute from event history.
///
/// Implementors provide the state transition (`when`) and the snapshot
/// factories; versioning, uncommitted-event tracking and replay are shared.
pub trait Aggregate: Send + Sync + Sized {
    /// The event enum this aggregate produces and consumes.
    type Event: AggregateEvent;

    /// Serializable state captured in snapshots.
    type State: Serialize + DeserializeOwned;

    /// Aggregate type name, used as the stream prefix.
    const AGGREGATE_TYPE: &'static str;

    /// Creates a blank aggregate at version 0.
    fn new(id: Uuid) -> Self;

    /// Rebuilds an aggregate from snapshot state at `version`.
    fn from_snapshot(id: Uuid, version: i64, state: Self::State) -> Self;

    /// Captures the current state for a snapshot.
    fn snapshot_state(&self) -> Self::State;

    /// Shared bookkeeping.
    fn root(&self) -> &AggregateRoot<Self::Event>;

    /// Shared bookkeeping, mutable.
    fn root_mut(&mut self) -> &mut AggregateRoot<Self::Event>;

    /// Mutates fields for one event. Must match every variant.
    fn when(&mut self, event: &Self::Event);

    /// Whether the aggregate reached a terminal state.
    fn is_terminal(&self) -> bool {
        false
    }

    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> Uuid {
        self.root().id
    }

    /// Returns the current version.
    fn version(&self) -> i64 {
        self.root().version
    }

    /// Returns the stream identifier (`<aggregateType>-<uuid>`).
    fn stream_id(&self) -> String {
        stream_id(Self::AGGREGATE_TYPE, self.aggregate_id())
    }

    /// Returns the events raised since the last save.
    fn uncommitted_events(&self) -> &[DomainEvent<Self::Event>] {
        self.root().uncommitted_events()
    }

    /// Applies an event and advances the version. Events applied outside
    /// replay are recorded as uncommitted.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::StreamCorrupted` when the event belongs to a
    /// different aggregate or does not carry the next version.
    fn apply(&mut self, event: DomainEvent<Self::Event>, is_replay: bool) -> Result<(), DomainError> {
        let root = self.root();
        if event.aggregate_id != root.id {
            return Err(DomainError::StreamCorrupted(format!(
                "event {} belongs to aggregate {}, not {}",
                event.id, event.aggregate_id, root.id
            )));
        }
        if event.aggregate_version != root.version + 1 {
            return Err(DomainError::StreamCorrupted(format!(
                "event {} has version {} but aggregate {} is at version {}",
                event.id, event.aggregate_version, root.id, root.version
            )));
        }

        self.when(&event.payload);

        let root = self.root_mut();
        root.version = event.aggregate_version;
        if !is_replay {
            root.uncommitted_events.push(event);
        }
        Ok(())
    }

    /// Raises a new event from a command method.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Aggregate::apply`].
    fn raise(
        &mut self,
        payload: Self::Event,
        metadata: EventMetadata,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        let event = DomainEvent {
            id: Uuid::new_v4(),
            aggregate_id: self.aggregate_id(),
            aggregate_version: self.version() + 1,
            occurred_at: clock.now(),
            metadata,
            payload,
        };
        self.apply(event, false)
    }

    /// Clears uncommitted events after a successful save.
    fn mark_events_as_committed(&mut self) {
        self.root_mut().uncommitted_events.clear();
    }

    /// Fails with `DomainError::AggregateTerminated` once terminal.
    ///
    /// # Errors
    ///
    /// See above.
    fn ensure_active(&self) -> Result<(), DomainError> {
        if self.is_terminal() {
            return Err(DomainError::AggregateTerminated(self.aggregate_id()));
        }
        Ok(())
    }
}
