//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::error::RelayError;

/// Installs the global JSON subscriber. `RUST_LOG` overrides the default
/// `info` filter.
///
/// # Errors
///
/// Returns `RelayError::Telemetry` if a global subscriber is already set.
pub fn init_tracing() -> Result<(), RelayError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .try_init()
        .map_err(|e| RelayError::Telemetry(e.to_string()))
}
