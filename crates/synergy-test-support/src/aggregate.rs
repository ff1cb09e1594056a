//! A small aggregate for exercising repositories and stores.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use synergy_core::aggregate::{Aggregate, AggregateRoot};
use synergy_core::clock::Clock;
use synergy_core::error::DomainError;
use synergy_core::event::{AggregateEvent, EventMetadata, decode_payload, encode_payload};

/// Events raised by [`Counter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterEvent {
    /// Counter was opened with a label.
    Opened {
        /// Display label.
        label: String,
    },
    /// Counter was incremented.
    Incremented {
        /// Amount added.
        amount: i64,
    },
    /// Counter was closed. Terminal.
    Closed,
}

#[derive(Serialize, Deserialize)]
struct OpenedPayload {
    label: String,
}

#[derive(Serialize, Deserialize)]
struct IncrementedPayload {
    amount: i64,
}

impl AggregateEvent for CounterEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "CounterOpened",
            Self::Incremented { .. } => "CounterIncremented",
            Self::Closed => "CounterClosed",
        }
    }

    fn encode(&self) -> Result<serde_json::Value, DomainError> {
        match self {
            Self::Opened { label } => encode_payload(&OpenedPayload {
                label: label.clone(),
            }),
            Self::Incremented { amount } => encode_payload(&IncrementedPayload { amount: *amount }),
            Self::Closed => Ok(serde_json::json!({})),
        }
    }

    fn decode(event_type: &str, payload: serde_json::Value) -> Result<Self, DomainError> {
        match event_type {
            "CounterOpened" => {
                let p: OpenedPayload = decode_payload(event_type, payload)?;
                Ok(Self::Opened { label: p.label })
            }
            "CounterIncremented" => {
                let p: IncrementedPayload = decode_payload(event_type, payload)?;
                Ok(Self::Incremented { amount: p.amount })
            }
            "CounterClosed" => Ok(Self::Closed),
            other => Err(DomainError::UnknownEventType(other.to_owned())),
        }
    }
}

/// Snapshot state of a [`Counter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    /// Display label.
    pub label: String,
    /// Running total.
    pub total: i64,
    /// Whether the counter is closed.
    pub closed: bool,
}

/// Test aggregate: a labelled running total that can be closed.
#[derive(Debug, Clone)]
pub struct Counter {
    root: AggregateRoot<CounterEvent>,
    state: CounterState,
}

impl Counter {
    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> &CounterState {
        &self.state
    }

    /// Opens the counter.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the counter was already opened.
    pub fn open(&mut self, label: &str, clock: &dyn Clock) -> Result<(), DomainError> {
        if self.version() > 0 {
            return Err(DomainError::Validation("counter already opened".into()));
        }
        self.raise(
            CounterEvent::Opened {
                label: label.to_owned(),
            },
            EventMetadata::new("test-support"),
            clock,
        )
    }

    /// Adds a positive amount.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateTerminated` once closed and
    /// `DomainError::Validation` for non-positive amounts.
    pub fn increment(&mut self, amount: i64, clock: &dyn Clock) -> Result<(), DomainError> {
        self.ensure_active()?;
        if amount <= 0 {
            return Err(DomainError::Validation("amount must be positive".into()));
        }
        self.raise(
            CounterEvent::Incremented { amount },
            EventMetadata::new("test-support"),
            clock,
        )
    }

    /// Closes the counter.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateTerminated` if already closed.
    pub fn close(&mut self, clock: &dyn Clock) -> Result<(), DomainError> {
        self.ensure_active()?;
        self.raise(CounterEvent::Closed, EventMetadata::new("test-support"), clock)
    }
}

impl Aggregate for Counter {
    type Event = CounterEvent;
    type State = CounterState;

    const AGGREGATE_TYPE: &'static str = "counter";

    fn new(id: Uuid) -> Self {
        Self {
            root: AggregateRoot::new(id),
            state: CounterState::default(),
        }
    }

    fn from_snapshot(id: Uuid, version: i64, state: CounterState) -> Self {
        Self {
            root: AggregateRoot::at_version(id, version),
            state,
        }
    }

    fn snapshot_state(&self) -> CounterState {
        self.state.clone()
    }

    fn root(&self) -> &AggregateRoot<CounterEvent> {
        &self.root
    }

    fn root_mut(&mut self) -> &mut AggregateRoot<CounterEvent> {
        &mut self.root
    }

    fn when(&mut self, event: &CounterEvent) {
        match event {
            CounterEvent::Opened { label } => self.state.label.clone_from(label),
            CounterEvent::Incremented { amount } => self.state.total += amount,
            CounterEvent::Closed => self.state.closed = true,
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.closed
    }
}
