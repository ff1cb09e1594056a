//! Shared test doubles and fixtures for the Synergy event core.

mod aggregate;
mod clock;
mod store;

pub use aggregate::{Counter, CounterEvent, CounterState};
pub use clock::{FixedClock, SteppingClock};
pub use store::{FailingStore, RecordingStore, StoreCall};
