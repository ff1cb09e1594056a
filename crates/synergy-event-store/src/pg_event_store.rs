//! `PostgreSQL` implementation of the event and snapshot stores.
//!
//! Uses runtime query construction (not compile-time checked) so builds do
//! not need a live database. The global position is an identity column,
//! which is durable and never reused; rolled-back transactions may leave
//! gaps. Appends hold a transaction-scoped advisory lock, so positions are
//! assigned in commit order and a position reader never sees a lower
//! position commit after a higher one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use synergy_core::error::DomainError;
use synergy_core::event::EventMetadata;
use synergy_core::event_store::{
    AggregateStore, Commit, EventStore, NewEvent, PendingSnapshot, StoredEvent,
};
use synergy_core::snapshot::{Snapshot, SnapshotStore};

use crate::schema::STREAM_VERSION_CONSTRAINT;

/// Transaction-scoped advisory lock key serializing appends to the global
/// log. Anything else inserting into `events` must hold it too.
pub const APPEND_LOCK_KEY: i64 = 0x5359_4e45_5247_5931;

const SELECT_EVENTS: &str = r"SELECT position, event_id, stream_id, aggregate_id, version, event_type, payload, metadata, occurred_at
  FROM events";

/// PostgreSQL-backed event and snapshot store.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Creates a new `PgEventStore` on an injected pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Upserts the optional snapshot and appends the events in one
    /// transaction. Any error drops the transaction, which rolls it back.
    async fn append_in_transaction(
        &self,
        stream_id: &str,
        events: Vec<NewEvent>,
        expected_version: i64,
        snapshot: Option<PendingSnapshot>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if let Some(snapshot) = snapshot {
            upsert_snapshot(&mut tx, &snapshot).await?;
        }

        let stored = match append(&mut tx, stream_id, events, expected_version).await {
            Ok(stored) => stored,
            Err(AppendError::VersionTaken) => {
                drop(tx);
                let actual = self.stream_version(stream_id).await?;
                return Err(DomainError::ConcurrencyConflict {
                    stream_id: stream_id.to_owned(),
                    expected: expected_version,
                    actual,
                });
            }
            Err(AppendError::Domain(err)) => return Err(err),
        };

        tx.commit().await.map_err(map_sqlx_error)?;

        tracing::debug!(
            stream_id,
            expected_version,
            count = stored.len(),
            "Appended events"
        );
        Ok(stored)
    }
}

enum AppendError {
    /// A concurrent writer inserted the same `(stream_id, version)`.
    VersionTaken,
    Domain(DomainError),
}

impl From<DomainError> for AppendError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

async fn append(
    conn: &mut PgConnection,
    stream_id: &str,
    events: Vec<NewEvent>,
    expected_version: i64,
) -> Result<Vec<StoredEvent>, AppendError> {
    let actual: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM events WHERE stream_id = $1")
            .bind(stream_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;

    if actual != expected_version {
        return Err(DomainError::ConcurrencyConflict {
            stream_id: stream_id.to_owned(),
            expected: expected_version,
            actual,
        }
        .into());
    }

    let mut stored = Vec::with_capacity(events.len());
    let mut version = expected_version;
    for event in events {
        version += 1;
        let result = sqlx::query_scalar::<_, i64>(
            r"INSERT INTO events (event_id, stream_id, aggregate_id, version, event_type, payload, metadata, occurred_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
              RETURNING position",
        )
        .bind(event.id)
        .bind(stream_id)
        .bind(event.aggregate_id)
        .bind(version)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(Json(&event.metadata))
        .bind(event.occurred_at)
        .fetch_one(&mut *conn)
        .await;

        let position = match result {
            Ok(position) => position,
            Err(sqlx::Error::Database(db))
                if db.constraint() == Some(STREAM_VERSION_CONSTRAINT) =>
            {
                return Err(AppendError::VersionTaken);
            }
            Err(err) => return Err(map_sqlx_error(err).into()),
        };
        stored.push(event.into_stored(stream_id, version, position));
    }
    Ok(stored)
}

async fn upsert_snapshot(
    conn: &mut PgConnection,
    snapshot: &PendingSnapshot,
) -> Result<(), DomainError> {
    sqlx::query(
        r"INSERT INTO snapshots (aggregate_id, version, data, created_at, updated_at)
          VALUES ($1, $2, $3, NOW(), NOW())
          ON CONFLICT (aggregate_id) DO UPDATE
            SET version = EXCLUDED.version, data = EXCLUDED.data, updated_at = NOW()
            WHERE snapshots.version <= EXCLUDED.version",
    )
    .bind(snapshot.aggregate_id)
    .bind(snapshot.version)
    .bind(&snapshot.data)
    .execute(conn)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

/// Maps sqlx errors onto the domain error kinds callers act on.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> DomainError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => DomainError::StorageUnavailable(err.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            DomainError::Serialization(err.to_string())
        }
        _ => DomainError::Infrastructure(err.to_string()),
    }
}

/// A row from the `events` table.
#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    position: i64,
    event_id: Uuid,
    stream_id: String,
    aggregate_id: Uuid,
    version: i64,
    event_type: String,
    payload: serde_json::Value,
    metadata: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for StoredEvent {
    type Error = DomainError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let metadata: EventMetadata = serde_json::from_value(row.metadata).map_err(|e| {
            DomainError::Serialization(format!("metadata of event {}: {e}", row.event_id))
        })?;
        Ok(Self {
            id: row.event_id,
            stream_id: row.stream_id,
            event_type: row.event_type,
            aggregate_id: row.aggregate_id,
            version: row.version,
            position: row.position,
            payload: row.payload,
            metadata,
            occurred_at: row.occurred_at,
        })
    }
}

fn into_stored(rows: Vec<EventRow>) -> Result<Vec<StoredEvent>, DomainError> {
    rows.into_iter().map(StoredEvent::try_from).collect()
}

/// A row from the `snapshots` table.
#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    aggregate_id: Uuid,
    version: i64,
    data: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SnapshotRow> for Snapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            aggregate_id: row.aggregate_id,
            version: row.version,
            data: row.data,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn save_events(
        &self,
        stream_id: &str,
        events: Vec<NewEvent>,
        expected_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.append_in_transaction(stream_id, events, expected_version, None)
            .await
    }

    async fn get_events(
        &self,
        stream_id: &str,
        from_version: i64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_EVENTS} WHERE stream_id = $1 AND version >= $2 ORDER BY version"
        ))
        .bind(stream_id)
        .bind(from_version)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        into_stored(rows)
    }

    async fn get_all_events(
        &self,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_EVENTS} WHERE position >= $1 ORDER BY position"
        ))
        .bind(from_position.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        into_stored(rows)
    }

    async fn read_all(
        &self,
        from_position: i64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_EVENTS} WHERE position >= $1 ORDER BY position LIMIT $2"
        ))
        .bind(from_position)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        into_stored(rows)
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_EVENTS} WHERE event_type = $1 AND position >= $2 ORDER BY position"
        ))
        .bind(event_type)
        .bind(from_position.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        into_stored(rows)
    }

    async fn stream_version(&self, stream_id: &str) -> Result<i64, DomainError> {
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM events WHERE stream_id = $1")
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl SnapshotStore for PgEventStore {
    async fn save(
        &self,
        aggregate_id: Uuid,
        version: i64,
        state: serde_json::Value,
    ) -> Result<(), DomainError> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        upsert_snapshot(
            &mut conn,
            &PendingSnapshot {
                aggregate_id,
                version,
                data: state,
            },
        )
        .await
    }

    async fn load(&self, aggregate_id: Uuid) -> Result<Option<Snapshot>, DomainError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r"SELECT aggregate_id, version, data, created_at, updated_at
              FROM snapshots
              WHERE aggregate_id = $1",
        )
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.map(Snapshot::from))
    }
}

#[async_trait]
impl AggregateStore for PgEventStore {
    async fn commit(&self, commit: Commit) -> Result<Vec<StoredEvent>, DomainError> {
        self.append_in_transaction(
            &commit.stream_id,
            commit.events,
            commit.expected_version,
            commit.snapshot,
        )
        .await
    }
}
