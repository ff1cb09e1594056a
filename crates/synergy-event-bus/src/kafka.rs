//! Apache Kafka transport.
//!
//! Producers use `acks=all` with idempotence, so an acknowledged record is
//! replicated. Consumers disable auto commit; the bus commits explicitly
//! after its handler succeeds. librdkafka reconnects brokers on its own, so
//! a session counts as lost only when metadata probes keep failing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::Message as _;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;

use crate::error::BusError;
use crate::transport::{
    BrokerSession, BrokerTransport, ConsumerChannel, Delivery, InboundRecord, OutboundRecord,
};

/// Kafka connection settings.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,
    /// Client id reported to the brokers.
    pub client_id: Option<String>,
    /// Where a new group starts reading (`earliest` or `latest`).
    pub auto_offset_reset: String,
    /// Consumer session timeout.
    pub session_timeout: Duration,
    /// Timeout of one metadata request.
    pub metadata_timeout: Duration,
    /// Interval between liveness probes.
    pub probe_interval: Duration,
    /// Consecutive failed probes before the session counts as lost.
    pub probe_failures: u32,
}

impl KafkaConfig {
    /// Creates a configuration for `brokers` with default timeouts.
    #[must_use]
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            client_id: None,
            auto_offset_reset: "earliest".to_owned(),
            session_timeout: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(10),
            probe_failures: 3,
        }
    }

    /// Sets the client id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.brokers);
        if let Some(ref client_id) = self.client_id {
            config.set("client.id", client_id);
        }
        config
    }
}

/// Opens Kafka sessions.
#[derive(Debug, Clone)]
pub struct KafkaTransport {
    config: KafkaConfig,
}

impl KafkaTransport {
    /// Creates a transport.
    #[must_use]
    pub fn new(config: KafkaConfig) -> Self {
        Self { config }
    }
}

async fn fetch_topics(
    producer: &FutureProducer,
    timeout: Duration,
) -> Result<Vec<String>, BusError> {
    let producer = producer.clone();
    tokio::task::spawn_blocking(move || {
        producer
            .client()
            .fetch_metadata(None, Timeout::After(timeout))
            .map(|metadata| {
                metadata
                    .topics()
                    .iter()
                    .map(|topic| topic.name().to_owned())
                    .collect()
            })
    })
    .await
    .map_err(|e| BusError::Connection(format!("metadata task failed: {e}")))?
    .map_err(BusError::from)
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn open(&self) -> Result<Arc<dyn BrokerSession>, BusError> {
        tracing::info!(brokers = %self.config.brokers, "Connecting to Kafka");
        let producer: FutureProducer = self
            .config
            .client_config()
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()?;

        let topics = fetch_topics(&producer, self.config.metadata_timeout).await?;
        tracing::info!(topics = topics.len(), "Connected to Kafka");

        Ok(Arc::new(KafkaSession {
            config: self.config.clone(),
            producer,
            closed: AtomicBool::new(false),
        }))
    }
}

struct KafkaSession {
    config: KafkaConfig,
    producer: FutureProducer,
    closed: AtomicBool,
}

impl KafkaSession {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for KafkaSession {
    async fn produce(&self, record: OutboundRecord) -> Result<Delivery, BusError> {
        self.ensure_open()?;
        let headers = record
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                })
            });
        let future_record = FutureRecord::to(&record.topic)
            .key(&record.key)
            .payload(&record.payload)
            .headers(headers);

        let delivery = self
            .producer
            .send(future_record, Timeout::Never)
            .await
            .map_err(|(e, _)| BusError::Publish {
                topic: record.topic.clone(),
                reason: e.to_string(),
            })?;
        Ok(Delivery {
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }

    async fn join_group(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn ConsumerChannel>, BusError> {
        self.ensure_open()?;
        let consumer: StreamConsumer = self
            .config
            .client_config()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set(
                "session.timeout.ms",
                self.config.session_timeout.as_millis().to_string(),
            )
            .create()?;
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topics)?;
        tracing::info!(group_id, topics = ?topics, "Joined Kafka consumer group");
        Ok(Box::new(KafkaConsumer { consumer }))
    }

    async fn list_topics(&self) -> Result<Vec<String>, BusError> {
        self.ensure_open()?;
        fetch_topics(&self.producer, self.config.metadata_timeout).await
    }

    async fn lost(&self) {
        let mut failures = 0;
        loop {
            tokio::time::sleep(self.config.probe_interval).await;
            if self.closed.load(Ordering::Acquire) {
                continue;
            }
            match fetch_topics(&self.producer, self.config.metadata_timeout).await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(failures, error = %e, "Kafka liveness probe failed");
                    if failures >= self.config.probe_failures {
                        return;
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Release);
        let producer = self.producer.clone();
        let timeout = self.config.metadata_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BusError::Connection(format!("flush task failed: {e}")))??;
        tracing::info!("Closed Kafka session");
        Ok(())
    }
}

struct KafkaConsumer {
    consumer: StreamConsumer,
}

#[async_trait]
impl ConsumerChannel for KafkaConsumer {
    async fn poll(&self) -> Result<InboundRecord, BusError> {
        let message = self.consumer.recv().await?;
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|header| {
                        header.value.map(|value| {
                            (
                                header.key.to_owned(),
                                String::from_utf8_lossy(value).into_owned(),
                            )
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(InboundRecord {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            headers,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    async fn commit(&self, record: &InboundRecord) -> Result<(), BusError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    fn pause(&self, topic: &str, partition: i32) -> Result<(), BusError> {
        self.consumer.pause(&single_partition(topic, partition))?;
        Ok(())
    }

    fn resume(&self, topic: &str, partition: i32) -> Result<(), BusError> {
        self.consumer.resume(&single_partition(topic, partition))?;
        Ok(())
    }
}

fn single_partition(topic: &str, partition: i32) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    list.add_partition(topic, partition);
    list
}
