//! Event bus configuration.

use std::time::Duration;

/// Default topic prefix.
pub const DEFAULT_TOPIC_PREFIX: &str = "synergy";

/// Backoff schedule for reconnect attempts after an unexpected disconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Attempts before giving up and entering `Failed`.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Sets the first delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before `attempt` (1-based): `initial * multiplier^(attempt-1)`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Configuration for [`crate::EventBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Prefix of every topic name (`<prefix>.<aggregate_type>.events`).
    pub topic_prefix: String,
    /// How long `publish` waits for the broker acknowledgement.
    pub publish_timeout: Duration,
    /// How long `disconnect` waits for in-flight handlers before aborting.
    pub drain_timeout: Duration,
    /// Buffered records per partition worker.
    pub partition_buffer: usize,
    /// Reconnect schedule.
    pub reconnect: ReconnectPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_owned(),
            publish_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            partition_buffer: 64,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl BusConfig {
    /// Sets the topic prefix.
    #[must_use]
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Sets the publish acknowledgement timeout.
    #[must_use]
    pub const fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Sets the shutdown drain timeout.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Sets the per-partition buffer (at least 1).
    #[must_use]
    pub fn with_partition_buffer(mut self, records: usize) -> Self {
        self.partition_buffer = records.max(1);
        self
    }

    /// Sets the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Topic carrying events of `aggregate_type`.
    #[must_use]
    pub fn topic_for(&self, aggregate_type: &str) -> String {
        format!(
            "{}.{}.events",
            self.topic_prefix,
            aggregate_type.to_lowercase()
        )
    }
}
