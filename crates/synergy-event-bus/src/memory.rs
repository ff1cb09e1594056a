//! In-process broker for tests and single-process deployments.
//!
//! Topics are split into a fixed number of partitions; records are routed by
//! a hash of their key. Consumer groups keep committed offsets, and a member
//! that joins starts from the group's committed offset, so anything read but
//! not committed is delivered again. `set_available(false)` and
//! `drop_connections()` simulate outages: every open session is lost and its
//! channels start failing.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};

use crate::error::BusError;
use crate::transport::{
    BrokerSession, BrokerTransport, ConsumerChannel, Delivery, InboundRecord, OutboundRecord,
};

const DEFAULT_PARTITIONS: i32 = 3;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: String,
    headers: Vec<(String, String)>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: BTreeMap<String, Vec<Vec<StoredRecord>>>,
    /// Next offset to read per (group, topic, partition).
    committed: HashMap<(String, String, i32), i64>,
    unavailable: bool,
}

#[derive(Debug)]
struct Shared {
    partitions: i32,
    state: Mutex<BrokerState>,
    appended: Notify,
    generation: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn sever(&self) {
        self.generation.send_modify(|g| *g += 1);
        self.appended.notify_waiters();
    }

    fn ensure_topic<'a>(
        &self,
        state: &'a mut BrokerState,
        topic: &str,
    ) -> &'a mut Vec<Vec<StoredRecord>> {
        state.topics.entry(topic.to_owned()).or_insert_with(|| {
            (0..self.partitions).map(|_| Vec::new()).collect()
        })
    }

    fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let partitions = u64::try_from(self.partitions).unwrap_or(1);
        i32::try_from(hasher.finish() % partitions).unwrap_or(0)
    }
}

/// Shared handle to an in-process broker. Clones see the same topics.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a broker with three partitions per topic.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Creates a broker with `partitions` partitions per topic (at least 1).
    #[must_use]
    pub fn with_partitions(partitions: i32) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1),
                state: Mutex::new(BrokerState::default()),
                appended: Notify::new(),
                generation,
            }),
        }
    }

    /// Makes the broker reachable or not. Going down loses every session.
    pub fn set_available(&self, available: bool) {
        self.shared.lock().unavailable = !available;
        if !available {
            self.shared.sever();
        }
        tracing::debug!(available, "In-memory broker availability changed");
    }

    /// Loses every open session while staying reachable.
    pub fn drop_connections(&self) {
        self.shared.sever();
    }

    /// Creates `topic` if it does not exist.
    pub fn create_topic(&self, topic: &str) {
        let mut state = self.shared.lock();
        self.shared.ensure_topic(&mut state, topic);
    }

    /// Returns every record of `topic`, partition by partition.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<InboundRecord> {
        let state = self.shared.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .zip(0..)
            .flat_map(|(records, partition)| {
                records.iter().zip(0..).map(move |(record, offset)| InboundRecord {
                    topic: topic.to_owned(),
                    partition,
                    offset,
                    key: Some(record.key.clone()),
                    headers: record.headers.clone(),
                    payload: record.payload.clone(),
                })
            })
            .collect()
    }

    /// Next offset `group` will read from `topic`/`partition`, if it ever
    /// committed there.
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .lock()
            .committed
            .get(&(group.to_owned(), topic.to_owned(), partition))
            .copied()
    }

    /// Sum of committed offsets of `group` across all partitions of `topic`.
    #[must_use]
    pub fn committed_total(&self, group: &str, topic: &str) -> i64 {
        self.shared
            .lock()
            .committed
            .iter()
            .filter(|((g, t, _), _)| g == group && t == topic)
            .map(|(_, offset)| offset)
            .sum()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn open(&self) -> Result<Arc<dyn BrokerSession>, BusError> {
        if self.shared.lock().unavailable {
            return Err(BusError::Connection("broker unavailable".into()));
        }
        Ok(Arc::new(MemorySession {
            shared: Arc::clone(&self.shared),
            generation: self.shared.generation(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    generation: u64,
    closed: AtomicBool,
}

fn ensure_alive(shared: &Shared, generation: u64, closed: bool) -> Result<(), BusError> {
    if closed {
        return Err(BusError::ChannelClosed);
    }
    if shared.generation() != generation {
        return Err(BusError::Connection("session lost".into()));
    }
    Ok(())
}

impl MemorySession {
    fn ensure_alive(&self) -> Result<(), BusError> {
        ensure_alive(
            &self.shared,
            self.generation,
            self.closed.load(Ordering::Acquire),
        )
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn produce(&self, record: OutboundRecord) -> Result<Delivery, BusError> {
        self.ensure_alive()?;
        let partition = self.shared.partition_for(&record.key);
        let offset = {
            let mut state = self.shared.lock();
            let partitions = self.shared.ensure_topic(&mut state, &record.topic);
            let log = &mut partitions[usize::try_from(partition).unwrap_or(0)];
            log.push(StoredRecord {
                key: record.key,
                headers: record.headers,
                payload: record.payload,
            });
            i64::try_from(log.len()).unwrap_or(i64::MAX) - 1
        };
        self.shared.appended.notify_waiters();
        Ok(Delivery { partition, offset })
    }

    async fn join_group(
        &self,
        group_id: &str,
        topics: &[String],
    ) -> Result<Box<dyn ConsumerChannel>, BusError> {
        self.ensure_alive()?;
        {
            let mut state = self.shared.lock();
            for topic in topics {
                self.shared.ensure_topic(&mut state, topic);
            }
        }
        Ok(Box::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            generation: self.generation,
            group_id: group_id.to_owned(),
            topics: topics.to_vec(),
            cursors: Mutex::new(HashMap::new()),
            paused: Mutex::new(HashSet::new()),
        }))
    }

    async fn list_topics(&self) -> Result<Vec<String>, BusError> {
        self.ensure_alive()?;
        Ok(self.shared.lock().topics.keys().cloned().collect())
    }

    async fn lost(&self) {
        let mut generation = self.shared.generation.subscribe();
        let _ = generation.wait_for(|g| *g != self.generation).await;
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    generation: u64,
    group_id: String,
    topics: Vec<String>,
    /// Next offset this member reads per (topic, partition).
    cursors: Mutex<HashMap<(String, i32), i64>>,
    paused: Mutex<HashSet<(String, i32)>>,
}

impl MemoryConsumer {
    fn try_next(&self) -> Result<Option<InboundRecord>, BusError> {
        ensure_alive(&self.shared, self.generation, false)?;
        let state = self.shared.lock();
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);

        for topic in &self.topics {
            let Some(partitions) = state.topics.get(topic) else {
                continue;
            };
            for (records, partition) in partitions.iter().zip(0..) {
                if paused.contains(&(topic.clone(), partition)) {
                    continue;
                }
                let cursor = cursors.entry((topic.clone(), partition)).or_insert_with(|| {
                    state
                        .committed
                        .get(&(self.group_id.clone(), topic.clone(), partition))
                        .copied()
                        .unwrap_or(0)
                });
                let Some(record) = usize::try_from(*cursor)
                    .ok()
                    .and_then(|i| records.get(i))
                else {
                    continue;
                };
                let offset = *cursor;
                *cursor += 1;
                return Ok(Some(InboundRecord {
                    topic: topic.clone(),
                    partition,
                    offset,
                    key: Some(record.key.clone()),
                    headers: record.headers.clone(),
                    payload: record.payload.clone(),
                }));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ConsumerChannel for MemoryConsumer {
    async fn poll(&self) -> Result<InboundRecord, BusError> {
        loop {
            let appended = self.shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(record) = self.try_next()? {
                return Ok(record);
            }
            appended.await;
        }
    }

    async fn commit(&self, record: &InboundRecord) -> Result<(), BusError> {
        ensure_alive(&self.shared, self.generation, false)?;
        let mut state = self.shared.lock();
        let next = state
            .committed
            .entry((
                self.group_id.clone(),
                record.topic.clone(),
                record.partition,
            ))
            .or_insert(0);
        *next = (*next).max(record.offset + 1);
        Ok(())
    }

    fn pause(&self, topic: &str, partition: i32) -> Result<(), BusError> {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((topic.to_owned(), partition));
        Ok(())
    }

    fn resume(&self, topic: &str, partition: i32) -> Result<(), BusError> {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(topic.to_owned(), partition));
        self.shared.appended.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(topic: &str, key: &str, body: &str) -> OutboundRecord {
        OutboundRecord {
            topic: topic.to_owned(),
            key: key.to_owned(),
            headers: vec![("event_type".to_owned(), "TagAdded".to_owned())],
            payload: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_same_key_lands_on_same_partition_in_order() {
        // Arrange
        let broker = InMemoryBroker::new();
        let session = broker.open().await.unwrap();

        // Act
        let first = session.produce(record("t", "client-1", "a")).await.unwrap();
        let second = session.produce(record("t", "client-1", "b")).await.unwrap();

        // Assert
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn test_uncommitted_records_are_redelivered_to_next_member() {
        // Arrange
        let broker = InMemoryBroker::with_partitions(1);
        let session = broker.open().await.unwrap();
        session.produce(record("t", "k", "a")).await.unwrap();
        session.produce(record("t", "k", "b")).await.unwrap();
        let topics = vec!["t".to_owned()];
        let member = session.join_group("g", &topics).await.unwrap();
        let a = member.poll().await.unwrap();
        member.commit(&a).await.unwrap();
        let b = member.poll().await.unwrap();
        assert_eq!(b.payload, b"b");

        // Act
        let next_member = session.join_group("g", &topics).await.unwrap();
        let redelivered = next_member.poll().await.unwrap();

        // Assert
        assert_eq!(redelivered.offset, 1);
        assert_eq!(redelivered.payload, b"b");
        assert_eq!(broker.committed_offset("g", "t", 0), Some(1));
    }

    #[tokio::test]
    async fn test_outage_loses_sessions_and_refuses_new_ones() {
        // Arrange
        let broker = InMemoryBroker::new();
        let session = broker.open().await.unwrap();

        // Act
        broker.set_available(false);

        // Assert
        session.lost().await;
        assert!(session.produce(record("t", "k", "a")).await.is_err());
        assert!(broker.open().await.is_err());
        broker.set_available(true);
        assert!(broker.open().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let broker = InMemoryBroker::new();
        let session = broker.open().await.unwrap();

        session.close().await.unwrap();

        assert!(matches!(
            session.list_topics().await,
            Err(BusError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_paused_partition_is_skipped_until_resumed() {
        // Arrange
        let broker = InMemoryBroker::with_partitions(2);
        let session = broker.open().await.unwrap();
        let first = session.produce(record("t", "a", "a")).await.unwrap();
        let other_key = (0..)
            .map(|i| format!("k{i}"))
            .find(|key| broker.shared.partition_for(key) != first.partition)
            .unwrap();
        session.produce(record("t", &other_key, "b")).await.unwrap();
        let member = session.join_group("g", &["t".to_owned()]).await.unwrap();

        // Act
        member.pause("t", first.partition).unwrap();
        let while_paused = member.poll().await.unwrap();
        member.resume("t", first.partition).unwrap();
        let after_resume = member.poll().await.unwrap();

        // Assert
        assert_eq!(while_paused.payload, b"b");
        assert_eq!(after_resume.partition, first.partition);
        assert_eq!(after_resume.payload, b"a");
    }
}
