//! Snapshot abstraction and snapshot cadence policies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Materialized aggregate state at a known stream version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Aggregate the snapshot belongs to.
    pub aggregate_id: Uuid,
    /// Stream version the state reflects.
    pub version: i64,
    /// Serialized aggregate state.
    pub data: serde_json::Value,
    /// When the first snapshot for this aggregate was written.
    pub created_at: DateTime<Utc>,
    /// When this snapshot was written.
    pub updated_at: DateTime<Utc>,
}

/// Store trait for the latest snapshot per aggregate.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Upserts the snapshot for `aggregate_id`, replacing any older one.
    async fn save(
        &self,
        aggregate_id: Uuid,
        version: i64,
        state: serde_json::Value,
    ) -> Result<(), DomainError>;

    /// Loads the latest snapshot, if any.
    async fn load(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError>;
}

/// Decides whether a commit should also write a snapshot.
pub trait SnapshotPolicy: Send + Sync + std::fmt::Debug {
    /// `previous_version` is the stream length before the commit and
    /// `new_version` the length after it.
    fn should_snapshot(&self, previous_version: i64, new_version: i64) -> bool;
}

/// Snapshot on every commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct EveryCommit;

impl SnapshotPolicy for EveryCommit {
    fn should_snapshot(&self, _previous_version: i64, _new_version: i64) -> bool {
        true
    }
}

/// Snapshot whenever a commit crosses a multiple of the interval.
#[derive(Debug, Clone, Copy)]
pub struct EveryNEvents {
    interval: i64,
}

impl EveryNEvents {
    /// Creates the policy. An interval below 1 is treated as 1.
    #[must_use]
    pub fn new(interval: i64) -> Self {
        Self {
            interval: interval.max(1),
        }
    }
}

impl SnapshotPolicy for EveryNEvents {
    fn should_snapshot(&self, previous_version: i64, new_version: i64) -> bool {
        previous_version / self.interval != new_version / self.interval
    }
}

/// Never snapshot; every load replays the full stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSnapshot;

impl SnapshotPolicy for NeverSnapshot {
    fn should_snapshot(&self, _previous_version: i64, _new_version: i64) -> bool {
        false
    }
}
