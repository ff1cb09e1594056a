//! Wrappers and failing implementations of the store traits.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use synergy_core::error::DomainError;
use synergy_core::event_store::{AggregateStore, Commit, EventStore, NewEvent, StoredEvent};
use synergy_core::snapshot::{Snapshot, SnapshotStore};
use uuid::Uuid;

/// One call observed by a `RecordingStore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    /// `EventStore::save_events`.
    SaveEvents {
        /// Target stream.
        stream_id: String,
        /// Expected version passed by the caller.
        expected_version: i64,
        /// Number of events in the batch.
        count: usize,
    },
    /// `EventStore::get_events`.
    GetEvents {
        /// Requested stream.
        stream_id: String,
        /// First version requested.
        from_version: i64,
    },
    /// `EventStore::get_all_events`.
    GetAllEvents {
        /// Cursor passed by the caller.
        from_position: Option<i64>,
    },
    /// `EventStore::read_all`.
    ReadAll {
        /// Cursor passed by the caller.
        from_position: i64,
        /// Page size passed by the caller.
        limit: usize,
    },
    /// `EventStore::get_events_by_type`.
    GetEventsByType {
        /// Requested type.
        event_type: String,
        /// Cursor passed by the caller.
        from_position: Option<i64>,
    },
    /// `EventStore::stream_version`.
    StreamVersion(String),
    /// `SnapshotStore::save`.
    SaveSnapshot {
        /// Aggregate the snapshot belongs to.
        aggregate_id: Uuid,
        /// Snapshot version.
        version: i64,
    },
    /// `SnapshotStore::load`.
    LoadSnapshot(Uuid),
    /// `AggregateStore::commit`.
    Commit {
        /// Target stream.
        stream_id: String,
        /// Expected version passed by the caller.
        expected_version: i64,
        /// Number of events in the batch.
        count: usize,
        /// Version of the snapshot written with the batch, if any.
        snapshot_version: Option<i64>,
    },
}

/// Delegates to an inner store and records every call.
pub struct RecordingStore {
    inner: Arc<dyn AggregateStore>,
    calls: Mutex<Vec<StoreCall>>,
}

impl std::fmt::Debug for RecordingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingStore")
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

impl RecordingStore {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn AggregateStore>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns every call recorded so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Forgets recorded calls.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: StoreCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl EventStore for RecordingStore {
    async fn save_events(
        &self,
        stream_id: &str,
        events: Vec<NewEvent>,
        expected_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.record(StoreCall::SaveEvents {
            stream_id: stream_id.to_owned(),
            expected_version,
            count: events.len(),
        });
        self.inner
            .save_events(stream_id, events, expected_version)
            .await
    }

    async fn get_events(
        &self,
        stream_id: &str,
        from_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.record(StoreCall::GetEvents {
            stream_id: stream_id.to_owned(),
            from_version,
        });
        self.inner.get_events(stream_id, from_version).await
    }

    async fn get_all_events(
        &self,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.record(StoreCall::GetAllEvents { from_position });
        self.inner.get_all_events(from_position).await
    }

    async fn read_all(
        &self,
        from_position: i64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.record(StoreCall::ReadAll {
            from_position,
            limit,
        });
        self.inner.read_all(from_position, limit).await
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.record(StoreCall::GetEventsByType {
            event_type: event_type.to_owned(),
            from_position,
        });
        self.inner.get_events_by_type(event_type, from_position).await
    }

    async fn stream_version(&self, stream_id: &str) -> Result<i64, DomainError> {
        self.record(StoreCall::StreamVersion(stream_id.to_owned()));
        self.inner.stream_version(stream_id).await
    }
}

#[async_trait]
impl SnapshotStore for RecordingStore {
    async fn save(
        &self,
        aggregate_id: Uuid,
        version: i64,
        state: serde_json::Value,
    ) -> Result<(), DomainError> {
        self.record(StoreCall::SaveSnapshot {
            aggregate_id,
            version,
        });
        self.inner.save(aggregate_id, version, state).await
    }

    async fn load(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        self.record(StoreCall::LoadSnapshot(aggregate_id));
        self.inner.load(aggregate_id).await
    }
}

#[async_trait]
impl AggregateStore for RecordingStore {
    async fn commit(&self, commit: Commit) -> Result<Vec<StoredEvent>, DomainError> {
        self.record(StoreCall::Commit {
            stream_id: commit.stream_id.clone(),
            expected_version: commit.expected_version,
            count: commit.events.len(),
            snapshot_version: commit.snapshot.as_ref().map(|s| s.version),
        });
        self.inner.commit(commit).await
    }
}

/// A store that always fails with `StorageUnavailable`. Useful for testing
/// error-handling paths.
#[derive(Debug)]
pub struct FailingStore;

fn unavailable() -> DomainError {
    DomainError::StorageUnavailable("connection refused".into())
}

#[async_trait]
impl EventStore for FailingStore {
    async fn save_events(
        &self,
        _stream_id: &str,
        _events: Vec<NewEvent>,
        _expected_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(unavailable())
    }

    async fn get_events(
        &self,
        _stream_id: &str,
        _from_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(unavailable())
    }

    async fn get_all_events(
        &self,
        _from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(unavailable())
    }

    async fn read_all(
        &self,
        _from_position: i64,
        _limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(unavailable())
    }

    async fn get_events_by_type(
        &self,
        _event_type: &str,
        _from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(unavailable())
    }

    async fn stream_version(&self, _stream_id: &str) -> Result<i64, DomainError> {
        Err(unavailable())
    }
}

#[async_trait]
impl SnapshotStore for FailingStore {
    async fn save(
        &self,
        _aggregate_id: Uuid,
        _version: i64,
        _state: serde_json::Value,
    ) -> Result<(), DomainError> {
        Err(unavailable())
    }

    async fn load(&self, _aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        Err(unavailable())
    }
}

#[async_trait]
impl AggregateStore for FailingStore {
    async fn commit(&self, _commit: Commit) -> Result<Vec<StoredEvent>, DomainError> {
        Err(unavailable())
    }
}
