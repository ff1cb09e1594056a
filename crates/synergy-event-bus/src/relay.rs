//! Store-to-broker relay.
//!
//! Reads the global log from a position cursor and publishes each event,
//! moving the cursor past an event only once the broker acknowledged it. A
//! failed publish ends the pump; the next pump starts again at the first
//! unacknowledged event. Delivery to the broker is therefore at least once,
//! provided the store assigns positions in commit order (`PgEventStore`
//! serializes appends for this). The log is read one bounded page per pump.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use synergy_core::event_store::EventStore;

use crate::bus::{EventBus, millis};
use crate::error::BusError;

/// Default number of events published per pump.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Copies committed events from an [`EventStore`] to an [`EventBus`].
pub struct EventRelay {
    store: Arc<dyn EventStore>,
    bus: EventBus,
    next_position: i64,
    batch_size: usize,
}

impl std::fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRelay")
            .field("next_position", &self.next_position)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl EventRelay {
    /// Creates a relay starting at the beginning of the log.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            next_position: 1,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Resumes from `position` (inclusive).
    #[must_use]
    pub fn with_start_position(mut self, position: i64) -> Self {
        self.next_position = position;
        self
    }

    /// Sets the maximum number of events per pump (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Position of the first event not yet acknowledged by the broker.
    #[must_use]
    pub fn next_position(&self) -> i64 {
        self.next_position
    }

    /// Publishes up to one batch and returns how many events were
    /// acknowledged.
    ///
    /// # Errors
    ///
    /// Returns the store error, or the publish error of the first event that
    /// was not acknowledged. Events acknowledged before it stay published.
    pub async fn pump(&mut self) -> Result<usize, BusError> {
        let events = self
            .store
            .read_all(self.next_position, self.batch_size)
            .await?;
        let mut published = 0;
        for event in events {
            self.bus.publish(&event).await?;
            self.next_position = event.position + 1;
            published += 1;
        }
        if published > 0 {
            tracing::debug!(
                published,
                next_position = self.next_position,
                "Relayed events"
            );
        }
        Ok(published)
    }

    /// Pumps every `interval` until `shutdown` is cancelled. A full batch
    /// is followed immediately by another pump. Returns the final cursor.
    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) -> i64 {
        tracing::info!(
            interval_ms = millis(interval),
            batch_size = self.batch_size,
            from_position = self.next_position,
            "Event relay started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            loop {
                if shutdown.is_cancelled() {
                    break 'outer;
                }
                match self.pump().await {
                    Ok(published) if published == self.batch_size => {}
                    Ok(_) => break,
                    Err(e) => {
                        tracing::warn!(
                            next_position = self.next_position,
                            retryable = e.is_retryable(),
                            error = %e,
                            "Relay pump failed"
                        );
                        break;
                    }
                }
            }
        }

        tracing::info!(next_position = self.next_position, "Event relay stopped");
        self.next_position
    }
}
