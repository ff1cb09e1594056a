//! In-memory implementation of the event and snapshot stores.
//!
//! All state sits behind one `RwLock`, which makes `commit` trivially atomic.
//! Positions come from an in-process counter and restart at 1 with a new
//! store; they are unique and increasing for the lifetime of the instance
//! only.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use synergy_core::clock::{Clock, SystemClock};
use synergy_core::error::DomainError;
use synergy_core::event_store::{AggregateStore, Commit, EventStore, NewEvent, StoredEvent};
use synergy_core::snapshot::{Snapshot, SnapshotStore};

#[derive(Debug, Default)]
struct State {
    /// Global log, ordered by position.
    log: Vec<StoredEvent>,
    /// Indices into `log` per stream, ordered by version.
    streams: HashMap<String, Vec<usize>>,
    snapshots: HashMap<Uuid, Snapshot>,
    last_position: i64,
}

impl State {
    fn stream_version(&self, stream_id: &str) -> i64 {
        self.streams
            .get(stream_id)
            .and_then(|indices| indices.last())
            .map_or(0, |&i| self.log[i].version)
    }

    fn append(
        &mut self,
        stream_id: &str,
        events: Vec<NewEvent>,
        expected_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let actual = self.stream_version(stream_id);
        if actual != expected_version {
            return Err(DomainError::ConcurrencyConflict {
                stream_id: stream_id.to_owned(),
                expected: expected_version,
                actual,
            });
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut stored = Vec::with_capacity(events.len());
        let mut version = expected_version;
        for event in events {
            version += 1;
            self.last_position += 1;
            stored.push(event.into_stored(stream_id, version, self.last_position));
        }

        let indices = self.streams.entry(stream_id.to_owned()).or_default();
        for event in &stored {
            indices.push(self.log.len());
            self.log.push(event.clone());
        }
        Ok(stored)
    }

    fn upsert_snapshot(
        &mut self,
        aggregate_id: Uuid,
        version: i64,
        data: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        match self.snapshots.get_mut(&aggregate_id) {
            Some(existing) if existing.version > version => {}
            Some(existing) => {
                existing.version = version;
                existing.data = data;
                existing.updated_at = now;
            }
            None => {
                self.snapshots.insert(
                    aggregate_id,
                    Snapshot {
                        aggregate_id,
                        version,
                        data,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
    }

    fn first_index_at(&self, from_position: Option<i64>) -> usize {
        from_position.map_or(0, |p| self.log.partition_point(|e| e.position < p))
    }
}

/// Reference in-memory event and snapshot store.
pub struct InMemoryEventStore {
    clock: Arc<dyn Clock>,
    state: RwLock<State>,
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore").finish_non_exhaustive()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Creates an empty store using the system clock for snapshot times.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store with an injected clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, DomainError> {
        self.state
            .read()
            .map_err(|_| DomainError::Infrastructure("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, DomainError> {
        self.state
            .write()
            .map_err(|_| DomainError::Infrastructure("in-memory store lock poisoned".into()))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn save_events(
        &self,
        stream_id: &str,
        events: Vec<NewEvent>,
        expected_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let stored = self.write()?.append(stream_id, events, expected_version)?;
        tracing::debug!(stream_id, expected_version, count = stored.len(), "Appended events");
        Ok(stored)
    }

    async fn get_events(
        &self,
        stream_id: &str,
        from_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let state = self.read()?;
        let Some(indices) = state.streams.get(stream_id) else {
            return Ok(Vec::new());
        };
        Ok(indices
            .iter()
            .map(|&i| &state.log[i])
            .filter(|e| e.version >= from_version)
            .cloned()
            .collect())
    }

    async fn get_all_events(
        &self,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let state = self.read()?;
        let start = state.first_index_at(from_position);
        Ok(state.log[start..].to_vec())
    }

    async fn read_all(
        &self,
        from_position: i64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let state = self.read()?;
        let start = state.first_index_at(Some(from_position));
        Ok(state.log[start..].iter().take(limit).cloned().collect())
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let state = self.read()?;
        let start = state.first_index_at(from_position);
        Ok(state.log[start..]
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect())
    }

    async fn stream_version(&self, stream_id: &str) -> Result<i64, DomainError> {
        Ok(self.read()?.stream_version(stream_id))
    }
}

#[async_trait]
impl SnapshotStore for InMemoryEventStore {
    async fn save(
        &self,
        aggregate_id: Uuid,
        version: i64,
        state: serde_json::Value,
    ) -> Result<(), DomainError> {
        let now = self.clock.now();
        self.write()?
            .upsert_snapshot(aggregate_id, version, state, now);
        Ok(())
    }

    async fn load(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        Ok(self.read()?.snapshots.get(&aggregate_id).cloned())
    }
}

#[async_trait]
impl AggregateStore for InMemoryEventStore {
    async fn commit(&self, commit: Commit) -> Result<Vec<StoredEvent>, DomainError> {
        let now = self.clock.now();
        let mut state = self.write()?;

        // Append first: a conflict must leave the snapshot untouched.
        let stored = state.append(&commit.stream_id, commit.events, commit.expected_version)?;
        if let Some(snapshot) = commit.snapshot {
            state.upsert_snapshot(snapshot.aggregate_id, snapshot.version, snapshot.data, now);
        }
        drop(state);

        tracing::debug!(
            stream_id = %commit.stream_id,
            expected_version = commit.expected_version,
            count = stored.len(),
            "Committed events"
        );
        Ok(stored)
    }
}
