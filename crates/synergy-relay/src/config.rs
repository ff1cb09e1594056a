//! Relay configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use synergy_event_bus::BusConfig;
use synergy_event_bus::relay::DEFAULT_BATCH_SIZE;
use synergy_event_store::PgStoreConfig;

use crate::error::RelayError;

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Settings for one relay process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// `PostgreSQL` connection URL (`DATABASE_URL`, required).
    pub database_url: String,
    /// Kafka bootstrap servers (`KAFKA_BROKERS`).
    pub kafka_brokers: String,
    /// Topic prefix (`RELAY_TOPIC_PREFIX`).
    pub topic_prefix: String,
    /// Pause between pumps (`RELAY_POLL_INTERVAL_MS`).
    pub poll_interval: Duration,
    /// Events published per pump (`RELAY_BATCH_SIZE`).
    pub batch_size: usize,
    /// Log position to start from (`RELAY_START_POSITION`).
    pub start_position: i64,
    /// Pool size (`DB_MAX_CONNECTIONS`).
    pub db_max_connections: u32,
}

impl RelayConfig {
    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Config` if `DATABASE_URL` is missing or a numeric
    /// variable does not parse.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    ///
    /// # Errors
    ///
    /// See [`RelayConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RelayError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                RelayError::Config("DATABASE_URL environment variable must be set".into())
            })?;
        let kafka_brokers =
            lookup("KAFKA_BROKERS").unwrap_or_else(|| "localhost:9092".to_owned());
        let topic_prefix = lookup("RELAY_TOPIC_PREFIX")
            .unwrap_or_else(|| BusConfig::default().topic_prefix);

        let poll_interval_ms: u64 =
            parse(&lookup, "RELAY_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        if poll_interval_ms == 0 {
            return Err(RelayError::Config(
                "RELAY_POLL_INTERVAL_MS must be greater than zero".into(),
            ));
        }
        let batch_size: usize = parse(&lookup, "RELAY_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(RelayError::Config(
                "RELAY_BATCH_SIZE must be greater than zero".into(),
            ));
        }

        Ok(Self {
            database_url,
            kafka_brokers,
            topic_prefix,
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            start_position: parse(&lookup, "RELAY_START_POSITION", 1)?,
            db_max_connections: parse(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
        })
    }

    /// Pool configuration for the event store.
    #[must_use]
    pub fn store_config(&self) -> PgStoreConfig {
        PgStoreConfig::new(&self.database_url).with_max_connections(self.db_max_connections)
    }

    /// Bus configuration for the broker connection.
    #[must_use]
    pub fn bus_config(&self) -> BusConfig {
        BusConfig::default().with_topic_prefix(&self.topic_prefix)
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, RelayError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RelayError::Config(format!("{key} must be a valid number: {e}"))),
        None => Ok(default),
    }
}
