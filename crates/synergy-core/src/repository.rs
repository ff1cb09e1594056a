//! Generic aggregate repository.
//!
//! Loads aggregates from the latest snapshot plus the events recorded after
//! it, and saves them by appending uncommitted events under an optimistic
//! version check. The snapshot and the events are written in one commit, so a
//! snapshot never gets ahead of its stream.

use std::marker::PhantomData;
use std::sync::Arc;

use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::error::DomainError;
use crate::event::DomainEvent;
use crate::event_store::{AggregateStore, Commit, PendingSnapshot, StoredEvent, stream_id};
use crate::snapshot::{EveryCommit, SnapshotPolicy};

/// Loads and saves aggregates of type `A`.
pub struct Repository<A> {
    store: Arc<dyn AggregateStore>,
    policy: Arc<dyn SnapshotPolicy>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> Clone for Repository<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
            _aggregate: PhantomData,
        }
    }
}

impl<A> std::fmt::Debug for Repository<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> Repository<A> {
    /// Creates a repository that snapshots on every commit.
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self {
            store,
            policy: Arc::new(EveryCommit),
            _aggregate: PhantomData,
        }
    }

    /// Replaces the snapshot policy.
    #[must_use]
    pub fn with_snapshot_policy(mut self, policy: Arc<dyn SnapshotPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Persists the aggregate's uncommitted events, and a snapshot when the
    /// policy asks for one, then clears the uncommitted list.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` if another writer got there
    /// first; the aggregate is left untouched so the caller can inspect it,
    /// but it must be reloaded before retrying. Storage and serialization
    /// errors propagate unchanged.
    pub async fn save(&self, aggregate: &mut A) -> Result<Vec<StoredEvent>, DomainError> {
        let uncommitted = aggregate.uncommitted_events();
        if uncommitted.is_empty() {
            return Ok(Vec::new());
        }

        let new_version = aggregate.version();
        let pending = i64::try_from(uncommitted.len())
            .map_err(|_| DomainError::Validation("too many uncommitted events".into()))?;
        let expected_version = new_version - pending;

        let events = uncommitted
            .iter()
            .map(DomainEvent::to_new_event)
            .collect::<Result<Vec<_>, _>>()?;

        let snapshot = if self.policy.should_snapshot(expected_version, new_version) {
            Some(PendingSnapshot {
                aggregate_id: aggregate.aggregate_id(),
                version: new_version,
                data: serde_json::to_value(aggregate.snapshot_state())?,
            })
        } else {
            None
        };

        let stream_id = aggregate.stream_id();
        let stored = self
            .store
            .commit(Commit {
                stream_id: stream_id.clone(),
                expected_version,
                events,
                snapshot,
            })
            .await?;

        aggregate.mark_events_as_committed();

        tracing::debug!(
            stream_id = %stream_id,
            expected_version,
            new_version,
            count = stored.len(),
            "Saved aggregate"
        );
        Ok(stored)
    }

    /// Loads the current state of an aggregate, or `None` if it has neither a
    /// snapshot nor events.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` or `DomainError::UnknownEventType`
    /// if the snapshot or any event cannot be decoded; the read is aborted
    /// rather than skipping the event.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<A>, DomainError> {
        let stream_id = stream_id(A::AGGREGATE_TYPE, id);
        let snapshot = self.store.load(id).await?;
        let from_version = snapshot.as_ref().map_or(1, |s| s.version + 1);
        let events = self.store.get_events(&stream_id, from_version).await?;

        let mut aggregate = match snapshot {
            Some(snapshot) => {
                let state: A::State = serde_json::from_value(snapshot.data).map_err(|e| {
                    DomainError::Serialization(format!("snapshot of {stream_id}: {e}"))
                })?;
                A::from_snapshot(id, snapshot.version, state)
            }
            None if events.is_empty() => return Ok(None),
            None => A::new(id),
        };

        replay(&mut aggregate, &events)?;

        tracing::trace!(
            stream_id = %stream_id,
            from_version,
            replayed = events.len(),
            version = aggregate.version(),
            "Loaded aggregate"
        );
        Ok(Some(aggregate))
    }

    /// Like [`Repository::get_by_id`] but fails with
    /// `DomainError::AggregateNotFound` when the aggregate does not exist.
    ///
    /// # Errors
    ///
    /// See above.
    pub async fn load(&self, id: Uuid) -> Result<A, DomainError> {
        self.get_by_id(id)
            .await?
            .ok_or(DomainError::AggregateNotFound(id))
    }

    /// Reconstructs the aggregate as of `version` by replaying from the first
    /// event, ignoring snapshots.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::get_by_id`].
    pub async fn get_by_id_and_version(
        &self,
        id: Uuid,
        version: i64,
    ) -> Result<Option<A>, DomainError> {
        let stream_id = stream_id(A::AGGREGATE_TYPE, id);
        let events: Vec<StoredEvent> = self
            .store
            .get_events(&stream_id, 1)
            .await?
            .into_iter()
            .filter(|e| e.version <= version)
            .collect();

        if events.is_empty() {
            return Ok(None);
        }

        let mut aggregate = A::new(id);
        replay(&mut aggregate, &events)?;
        Ok(Some(aggregate))
    }
}

fn replay<A: Aggregate>(aggregate: &mut A, events: &[StoredEvent]) -> Result<(), DomainError> {
    for stored in events {
        let event = DomainEvent::<A::Event>::from_stored(stored)?;
        aggregate.apply(event, true)?;
    }
    Ok(())
}
