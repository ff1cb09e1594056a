//! Synergy event store backends.
//!
//! `PgEventStore` persists the global event log and snapshots in
//! `PostgreSQL` through an explicitly constructed, injected pool.
//! `InMemoryEventStore` is the reference implementation used by tests and
//! single-process tooling.

pub mod config;
pub mod memory;
pub mod pg_event_store;
pub mod schema;

pub use config::PgStoreConfig;
pub use memory::InMemoryEventStore;
pub use pg_event_store::{APPEND_LOCK_KEY, PgEventStore};
