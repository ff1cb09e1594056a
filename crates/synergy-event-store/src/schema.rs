//! Event store database schema.
//!
//! The schema lives in the workspace `migrations/` directory and is embedded
//! at compile time, so the same files drive `sqlx::test` fixtures and
//! production startup.

use sqlx::PgPool;
use sqlx::migrate::Migrator;

use synergy_core::error::DomainError;

/// Embedded migrations for the `events` and `snapshots` tables.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Name of the global event log table.
pub const EVENTS_TABLE: &str = "events";

/// Name of the snapshot table.
pub const SNAPSHOTS_TABLE: &str = "snapshots";

/// Unique constraint enforcing one event per `(stream_id, version)`.
pub const STREAM_VERSION_CONSTRAINT: &str = "events_stream_version_unique";

/// Applies pending migrations.
///
/// # Errors
///
/// Returns `DomainError::StorageUnavailable` if the migrations cannot run.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), DomainError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| DomainError::StorageUnavailable(format!("migration failed: {e}")))?;
    tracing::info!(
        events = EVENTS_TABLE,
        snapshots = SNAPSHOTS_TABLE,
        "Event store schema is up to date"
    );
    Ok(())
}
