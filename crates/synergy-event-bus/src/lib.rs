//! Synergy event bus.
//!
//! Publishes committed events to a message broker and delivers them to
//! subscribers, with an explicit reconnection state machine. `EventRelay`
//! copies the durable event log to the broker. Transports: `InMemoryBroker`
//! always, `KafkaTransport` with the `kafka` feature.

pub mod bus;
pub mod config;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod relay;
pub mod state;
pub mod transport;

pub use bus::{
    BusMetrics, EventBus, EventHandler, HandlerError, MetricsSnapshot, SubscribeOptions,
    SubscriptionHandle, wait_for_signal,
};
pub use config::{BusConfig, ReconnectPolicy};
pub use error::BusError;
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConfig, KafkaTransport};
pub use memory::InMemoryBroker;
pub use relay::EventRelay;
pub use state::{ConnectionState, HealthReport};
