//! Broker transport seam.
//!
//! A `BrokerTransport` opens sessions; a `BrokerSession` produces records,
//! joins consumer groups and lists topics until it is closed or drops. The
//! bus owns the state machine around these calls, so transports stay free of
//! retry logic.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;

/// Header carrying the event identifier.
pub const HEADER_EVENT_ID: &str = "event_id";
/// Header carrying the event type.
pub const HEADER_EVENT_TYPE: &str = "event_type";
/// Header carrying the correlation identifier.
pub const HEADER_CORRELATION_ID: &str = "correlation_id";

/// A record to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    /// Target topic.
    pub topic: String,
    /// Partitioning key.
    pub key: String,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Serialized body.
    pub payload: Vec<u8>,
}

/// Broker acknowledgement of a produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Partition the record landed on.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

/// A record received from a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Partitioning key, if any.
    pub key: Option<String>,
    /// Header pairs.
    pub headers: Vec<(String, String)>,
    /// Serialized body.
    pub payload: Vec<u8>,
}

impl InboundRecord {
    /// Returns the first header named `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Opens a new session.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Connection` when the broker is unreachable.
    async fn open(&self) -> Result<Arc<dyn BrokerSession>, BusError>;
}

/// An open connection to the broker.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Produces a record and waits for the broker acknowledgement.
    async fn produce(&self, record: OutboundRecord) -> Result<Delivery, BusError>;

    /// Joins `group_id` for `topics`.
    async fn join_group(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn ConsumerChannel>, BusError>;

    /// Lists the topics the broker knows.
    async fn list_topics(&self) -> Result<Vec<String>, BusError>;

    /// Resolves once the session dropped without `close()` being called.
    async fn lost(&self);

    /// Closes the session.
    async fn close(&self) -> Result<(), BusError>;
}

/// Membership in a consumer group.
#[async_trait]
pub trait ConsumerChannel: Send + Sync {
    /// Waits for the next record. Must be cancel safe.
    async fn poll(&self) -> Result<InboundRecord, BusError>;

    /// Commits `record`'s offset for the group.
    async fn commit(&self, record: &InboundRecord) -> Result<(), BusError>;

    /// Stops fetching `topic`/`partition`. Records fetched before the pause
    /// may still be returned by `poll`.
    fn pause(&self, topic: &str, partition: i32) -> Result<(), BusError>;

    /// Fetches `topic`/`partition` again after [`ConsumerChannel::pause`].
    fn resume(&self, topic: &str, partition: i32) -> Result<(), BusError>;
}
