//! Relay daemon error types.

use synergy_core::error::DomainError;
use synergy_event_bus::BusError;
use thiserror::Error;

/// Startup and runtime errors for the relay daemon.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A required environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// The event store could not be reached or migrated.
    #[error("event store error: {0}")]
    Store(#[from] DomainError),

    /// The broker could not be reached.
    #[error("broker error: {0}")]
    Bus(#[from] BusError),

    /// The tracing subscriber could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(String),
}
