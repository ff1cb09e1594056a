//! Synergy relay daemon.
//!
//! Tails the `PostgreSQL` event log and publishes every committed event to
//! the broker, resuming from the first unacknowledged position after a
//! failure. Consumers dedupe by event id.

pub mod config;
pub mod error;
pub mod telemetry;

use std::sync::Arc;

use synergy_core::event_store::EventStore;
use synergy_event_bus::transport::BrokerTransport;
use synergy_event_bus::{EventBus, EventRelay};
use tokio_util::sync::CancellationToken;

pub use config::RelayConfig;
pub use error::RelayError;
pub use telemetry::init_tracing;

/// Connects the bus and relays events from `store` until `shutdown` is
/// cancelled. Returns the position of the first event not yet relayed.
///
/// # Errors
///
/// Returns `RelayError::Bus` if the broker cannot be reached at startup.
pub async fn serve(
    store: Arc<dyn EventStore>,
    transport: Arc<dyn BrokerTransport>,
    config: &RelayConfig,
    shutdown: CancellationToken,
) -> Result<i64, RelayError> {
    let bus = EventBus::new(transport, config.bus_config());
    bus.connect().await?;

    let relay = EventRelay::new(store, bus.clone())
        .with_start_position(config.start_position)
        .with_batch_size(config.batch_size);
    let next_position = relay.run(config.poll_interval, shutdown).await;

    let health = bus.health_check().await;
    tracing::info!(state = %health.state, next_position, "Relay shutting down");
    bus.disconnect().await?;
    Ok(next_position)
}

/// Runs the daemon against `PostgreSQL` and Kafka until Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns `RelayError::Store` if the database is unreachable or cannot be
/// migrated and `RelayError::Bus` if Kafka is unreachable.
#[cfg(feature = "kafka")]
pub async fn run(config: RelayConfig) -> Result<(), RelayError> {
    use synergy_event_bus::{KafkaConfig, KafkaTransport, wait_for_signal};
    use synergy_event_store::PgEventStore;
    use synergy_event_store::schema::ensure_schema;

    tracing::info!(
        brokers = %config.kafka_brokers,
        topic_prefix = %config.topic_prefix,
        "Starting Synergy relay"
    );

    let pool = config.store_config().connect().await?;
    ensure_schema(&pool).await?;
    let store: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool));
    let transport = KafkaTransport::new(
        KafkaConfig::new(config.kafka_brokers.clone()).with_client_id("synergy-relay"),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal.cancel();
    });

    serve(store, Arc::new(transport), &config, shutdown).await?;
    Ok(())
}
