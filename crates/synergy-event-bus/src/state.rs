//! Connection state machine.
//!
//! `Disconnected -> Connecting -> Connected`, then on an unexpected drop
//! `Connected -> Reconnecting{attempt} -> Connected | Failed`. `Failed` is left
//! only through an explicit `connect()`; `disconnect()` returns to
//! `Disconnected` from any state.

use std::fmt;

use serde::Serialize;

/// Observable state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session. Initial state and the result of `disconnect()`.
    Disconnected,
    /// `connect()` is opening a session.
    Connecting,
    /// A session is open.
    Connected,
    /// The session dropped; waiting for or running reconnect attempt
    /// `attempt` (1-based).
    Reconnecting {
        /// Current attempt.
        attempt: u32,
    },
    /// Reconnect attempts were exhausted.
    Failed,
}

impl ConnectionState {
    /// Whether a session is currently usable.
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of [`crate::EventBus::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// State at the time of the check.
    pub state: ConnectionState,
    /// Whether the broker answered a topic listing.
    pub connected: bool,
    /// Topics the broker reported, empty when unreachable.
    pub topics: Vec<String>,
    /// Error from the topic listing, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    /// Whether the bus is connected and the broker responds.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state.is_connected() && self.connected
    }
}
