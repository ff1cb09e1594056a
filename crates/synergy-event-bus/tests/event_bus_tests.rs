//! Integration tests for `EventBus` against the in-memory broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use synergy_core::event::EventMetadata;
use synergy_core::event_store::StoredEvent;
use synergy_event_bus::{
    BusConfig, BusError, ConnectionState, EventBus, EventHandler, HandlerError, InMemoryBroker,
    ReconnectPolicy, SubscribeOptions,
};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

const TOPIC: &str = "synergy.client.events";
const GROUP: &str = "projections";

fn make_event(aggregate_id: Uuid, version: i64) -> StoredEvent {
    StoredEvent {
        id: Uuid::new_v4(),
        stream_id: format!("client-{aggregate_id}"),
        event_type: "TagAdded".to_owned(),
        aggregate_id,
        version,
        position: version,
        payload: serde_json::json!({"tag": format!("t{version}")}),
        metadata: EventMetadata::new("tests").with_correlation_id(Uuid::new_v4()),
        occurred_at: Utc::now(),
    }
}

fn make_bus(broker: &InMemoryBroker) -> EventBus {
    let reconnect = ReconnectPolicy::default()
        .with_initial_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(1))
        .with_max_attempts(3);
    EventBus::new(
        Arc::new(broker.clone()),
        BusConfig::default()
            .with_reconnect(reconnect)
            .with_drain_timeout(Duration::from_secs(5)),
    )
}

/// Forwards every event it sees; fails the first `fail_first` calls.
struct Forwarding {
    seen: mpsc::UnboundedSender<StoredEvent>,
    fail_first: AtomicUsize,
    delay: Duration,
}

impl Forwarding {
    fn new(fail_first: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<StoredEvent>) {
        Self::with_delay(fail_first, Duration::ZERO)
    }

    fn with_delay(
        fail_first: usize,
        delay: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StoredEvent>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                seen,
                fail_first: AtomicUsize::new(fail_first),
                delay,
            }),
            rx,
        )
    }
}

#[async_trait]
impl EventHandler for Forwarding {
    async fn handle(&self, event: StoredEvent) -> Result<(), HandlerError> {
        let _ = self.seen.send(event);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let should_fail = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err("projection unavailable".into());
        }
        Ok(())
    }
}

/// Panics on its first call, then forwards.
struct PanicsOnce {
    seen: mpsc::UnboundedSender<StoredEvent>,
    calls: AtomicUsize,
}

#[async_trait]
impl EventHandler for PanicsOnce {
    async fn handle(&self, event: StoredEvent) -> Result<(), HandlerError> {
        assert!(
            self.calls.fetch_add(1, Ordering::SeqCst) > 0,
            "projection crashed"
        );
        let _ = self.seen.send(event);
        Ok(())
    }
}

/// Forwards every event; events of `blocked` fail, or wait for `release`
/// when one is given.
struct Blocking {
    blocked: Uuid,
    release: Option<watch::Receiver<bool>>,
    seen: mpsc::UnboundedSender<StoredEvent>,
}

#[async_trait]
impl EventHandler for Blocking {
    async fn handle(&self, event: StoredEvent) -> Result<(), HandlerError> {
        let is_blocked = event.aggregate_id == self.blocked;
        let _ = self.seen.send(event);
        if !is_blocked {
            return Ok(());
        }
        match &self.release {
            Some(release) => {
                let mut release = release.clone();
                let _ = release.wait_for(|open| *open).await;
                Ok(())
            }
            None => Err("poisoned stream".into()),
        }
    }
}

async fn partition_of(partitions: i32, aggregate_id: Uuid) -> i32 {
    let scratch = InMemoryBroker::with_partitions(partitions);
    let bus = make_bus(&scratch);
    bus.connect().await.unwrap();
    bus.publish(&make_event(aggregate_id, 1))
        .await
        .unwrap()
        .partition
}

/// Two aggregates whose streams land on different partitions.
async fn split_aggregates(partitions: i32) -> ((Uuid, i32), (Uuid, i32)) {
    let first = Uuid::new_v4();
    let first_partition = partition_of(partitions, first).await;
    loop {
        let other = Uuid::new_v4();
        let other_partition = partition_of(partitions, other).await;
        if other_partition != first_partition {
            return ((first, first_partition), (other, other_partition));
        }
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<StoredEvent>) -> StoredEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("handler dropped")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

// --- publish ---

#[tokio::test]
async fn test_publish_routes_by_aggregate_type_keyed_by_stream() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let event = make_event(Uuid::new_v4(), 1);

    // Act
    bus.publish(&event).await.unwrap();

    // Assert
    let records = broker.records(TOPIC);
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.key.as_deref(), Some(event.stream_id.as_str()));
    assert_eq!(record.header("event_type"), Some("TagAdded"));
    assert_eq!(record.header("event_id"), Some(event.id.to_string().as_str()));
    assert_eq!(
        record.header("correlation_id"),
        event
            .metadata
            .correlation_id
            .map(|id| id.to_string())
            .as_deref()
    );
    let decoded: StoredEvent = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(decoded, event);
    assert_eq!(bus.metrics().published, 1);
}

#[tokio::test]
async fn test_publish_before_connect_fails() {
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);

    let result = bus.publish(&make_event(Uuid::new_v4(), 1)).await;

    assert!(matches!(result, Err(BusError::NotConnected)));
    assert_eq!(bus.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_connect_to_unreachable_broker_stays_disconnected() {
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let bus = make_bus(&broker);

    let result = bus.connect().await;

    assert!(matches!(result, Err(BusError::Connection(_))));
    assert_eq!(bus.state(), ConnectionState::Disconnected);
}

// --- subscribe ---

#[tokio::test]
async fn test_subscriber_receives_stream_in_order_and_commits() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (handler, mut seen) = Forwarding::new(0);
    bus.subscribe(
        vec![TOPIC.to_owned()],
        handler,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();
    let aggregate_id = Uuid::new_v4();
    let first = make_event(aggregate_id, 1);
    let second = make_event(aggregate_id, 2);

    // Act
    bus.publish(&first).await.unwrap();
    bus.publish(&second).await.unwrap();

    // Assert
    assert_eq!(next_event(&mut seen).await.id, first.id);
    assert_eq!(next_event(&mut seen).await.id, second.id);
    eventually(|| broker.committed_total(GROUP, TOPIC) == 2).await;
    let metrics = bus.metrics();
    assert_eq!(metrics.delivered, 2);
    assert_eq!(metrics.committed, 2);
}

#[tokio::test]
async fn test_subscribe_without_topics_is_rejected() {
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (handler, _seen) = Forwarding::new(0);

    let result = bus
        .subscribe(Vec::new(), handler, SubscribeOptions::default())
        .await;

    assert!(matches!(result, Err(BusError::Configuration(_))));
}

#[tokio::test]
async fn test_default_group_derives_from_prefix_and_topics() {
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (handler, _seen) = Forwarding::new(0);

    let handle = bus
        .subscribe(vec![TOPIC.to_owned()], handler, SubscribeOptions::default())
        .await
        .unwrap();

    assert_eq!(handle.group_id(), "synergy-synergy.client.events");
}

#[tokio::test]
async fn test_handler_failure_is_counted_and_does_not_stop_subscription() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (handler, mut seen) = Forwarding::new(1);
    bus.subscribe(
        vec![TOPIC.to_owned()],
        handler,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();
    let aggregate_id = Uuid::new_v4();

    // Act
    bus.publish(&make_event(aggregate_id, 1)).await.unwrap();
    bus.publish(&make_event(aggregate_id, 2)).await.unwrap();

    // Assert
    next_event(&mut seen).await;
    next_event(&mut seen).await;
    eventually(|| bus.metrics().committed == 1).await;
    assert_eq!(bus.metrics().handler_failures, 1);
    assert_eq!(bus.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_panicking_handler_is_counted_and_does_not_stop_subscription() {
    // Arrange
    let broker = InMemoryBroker::with_partitions(1);
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (seen, mut rx) = mpsc::unbounded_channel();
    let handler = Arc::new(PanicsOnce {
        seen,
        calls: AtomicUsize::new(0),
    });
    bus.subscribe(
        vec![TOPIC.to_owned()],
        handler,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();
    let aggregate_id = Uuid::new_v4();
    let events: Vec<StoredEvent> = (1..=4).map(|v| make_event(aggregate_id, v)).collect();

    // Act
    for event in &events {
        bus.publish(event).await.unwrap();
    }

    // Assert
    for event in &events[1..] {
        assert_eq!(next_event(&mut rx).await.id, event.id);
    }
    eventually(|| bus.metrics().committed == 3).await;
    let metrics = bus.metrics();
    assert_eq!(metrics.handler_failures, 1);
    assert_eq!(metrics.delivered, 4);
    assert_eq!(bus.state(), ConnectionState::Connected);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(4));
}

#[tokio::test]
async fn test_failing_partition_does_not_stop_other_partitions() {
    // Arrange
    let ((poisoned, poisoned_partition), (healthy, healthy_partition)) =
        split_aggregates(4).await;
    let broker = InMemoryBroker::with_partitions(4);
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (seen, mut rx) = mpsc::unbounded_channel();
    let handler = Arc::new(Blocking {
        blocked: poisoned,
        release: None,
        seen,
    });
    bus.subscribe(
        vec![TOPIC.to_owned()],
        handler,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();

    // Act
    for version in 1..=3 {
        bus.publish(&make_event(poisoned, version)).await.unwrap();
        bus.publish(&make_event(healthy, version)).await.unwrap();
    }

    // Assert
    for _ in 0..6 {
        next_event(&mut rx).await;
    }
    eventually(|| broker.committed_offset(GROUP, TOPIC, healthy_partition) == Some(3)).await;
    eventually(|| bus.metrics().handler_failures == 3).await;
    assert_eq!(broker.committed_offset(GROUP, TOPIC, poisoned_partition), None);
    assert_eq!(bus.metrics().committed, 3);
}

#[tokio::test]
async fn test_stalled_partition_does_not_hold_up_other_partitions() {
    // Arrange
    let ((stalled, stalled_partition), (healthy, healthy_partition)) =
        split_aggregates(4).await;
    let broker = InMemoryBroker::with_partitions(4);
    let bus = EventBus::new(
        Arc::new(broker.clone()),
        BusConfig::default().with_partition_buffer(1),
    );
    bus.connect().await.unwrap();
    let (release, release_rx) = watch::channel(false);
    let (seen, mut rx) = mpsc::unbounded_channel();
    let handler = Arc::new(Blocking {
        blocked: stalled,
        release: Some(release_rx),
        seen,
    });
    bus.subscribe(
        vec![TOPIC.to_owned()],
        handler,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();
    let stalled_events: Vec<StoredEvent> = (1..=5).map(|v| make_event(stalled, v)).collect();
    for event in &stalled_events {
        bus.publish(event).await.unwrap();
    }
    assert_eq!(next_event(&mut rx).await.id, stalled_events[0].id);

    // Act
    for version in 1..=10 {
        bus.publish(&make_event(healthy, version)).await.unwrap();
    }

    // Assert
    eventually(|| broker.committed_offset(GROUP, TOPIC, healthy_partition) == Some(10)).await;
    assert_eq!(broker.committed_offset(GROUP, TOPIC, stalled_partition), None);

    release.send_replace(true);
    eventually(|| broker.committed_offset(GROUP, TOPIC, stalled_partition) == Some(5)).await;
    let mut stalled_seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.aggregate_id == stalled {
            stalled_seen.push(event.id);
        }
    }
    let expected: Vec<Uuid> = stalled_events[1..].iter().map(|e| e.id).collect();
    assert_eq!(stalled_seen, expected);
}

#[tokio::test]
async fn test_uncommitted_event_is_redelivered_after_restart() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (failing, mut failed_seen) = Forwarding::new(1);
    bus.subscribe(
        vec![TOPIC.to_owned()],
        failing,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();
    let event = make_event(Uuid::new_v4(), 1);
    bus.publish(&event).await.unwrap();
    next_event(&mut failed_seen).await;
    eventually(|| bus.metrics().handler_failures == 1).await;

    // Act
    bus.disconnect().await.unwrap();
    bus.connect().await.unwrap();
    let (handler, mut seen) = Forwarding::new(0);
    bus.subscribe(
        vec![TOPIC.to_owned()],
        handler,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();

    // Assert
    assert_eq!(next_event(&mut seen).await.id, event.id);
    eventually(|| broker.committed_total(GROUP, TOPIC) == 1).await;
}

#[tokio::test]
async fn test_unsubscribed_handler_receives_nothing() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (handler, mut seen) = Forwarding::new(0);
    let handle = bus
        .subscribe(
            vec![TOPIC.to_owned()],
            handler,
            SubscribeOptions::default().with_group_id(GROUP),
        )
        .await
        .unwrap();

    // Act
    handle.unsubscribe();
    bus.publish(&make_event(Uuid::new_v4(), 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    assert!(seen.try_recv().is_err());
    assert_eq!(bus.metrics().delivered, 0);
}

// --- reconnection ---

#[tokio::test(start_paused = true)]
async fn test_dropped_session_reconnects_and_resubscribes() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (handler, mut seen) = Forwarding::new(0);
    bus.subscribe(
        vec![TOPIC.to_owned()],
        handler,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();

    // Act
    broker.drop_connections();
    eventually(|| bus.metrics().reconnects == 1 && bus.state() == ConnectionState::Connected)
        .await;
    let event = make_event(Uuid::new_v4(), 1);
    bus.publish(&event).await.unwrap();

    // Assert
    assert_eq!(next_event(&mut seen).await.id, event.id);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failing_on_lost_session_leaves_nothing_running() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (handler, mut seen) = Forwarding::new(0);
    broker.drop_connections();

    // Act
    let result = bus
        .subscribe(
            vec![TOPIC.to_owned()],
            handler,
            SubscribeOptions::default().with_group_id(GROUP),
        )
        .await;
    eventually(|| bus.metrics().reconnects == 1 && bus.state() == ConnectionState::Connected)
        .await;
    bus.publish(&make_event(Uuid::new_v4(), 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    assert!(matches!(result, Err(BusError::Connection(_))));
    assert!(seen.try_recv().is_err());
    assert_eq!(bus.metrics().delivered, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnects_enter_failed_until_manual_connect() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (handler, mut seen) = Forwarding::new(0);
    bus.subscribe(
        vec![TOPIC.to_owned()],
        handler,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();
    let mut states = bus.watch_state();
    let started = tokio::time::Instant::now();

    // Act
    broker.set_available(false);
    tokio::time::timeout(
        Duration::from_secs(10),
        states.wait_for(|s| *s == ConnectionState::Failed),
    )
    .await
    .unwrap()
    .unwrap();
    let elapsed = started.elapsed();

    // Assert
    assert!(elapsed >= Duration::from_millis(700), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "elapsed {elapsed:?}");
    let event = make_event(Uuid::new_v4(), 1);
    assert!(matches!(
        bus.publish(&event).await,
        Err(BusError::Failed { attempts: 3 })
    ));
    assert!(!bus.health_check().await.is_healthy());

    broker.set_available(true);
    bus.connect().await.unwrap();
    assert_eq!(bus.state(), ConnectionState::Connected);
    bus.publish(&event).await.unwrap();
    assert_eq!(next_event(&mut seen).await.id, event.id);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_succeeds_once_broker_returns() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let mut states = bus.watch_state();

    // Act
    broker.set_available(false);
    tokio::time::timeout(
        Duration::from_secs(10),
        states.wait_for(|s| *s == ConnectionState::Reconnecting { attempt: 2 }),
    )
    .await
    .unwrap()
    .unwrap();
    broker.set_available(true);

    // Assert
    eventually(|| bus.state() == ConnectionState::Connected).await;
    assert_eq!(bus.metrics().reconnects, 1);
}

// --- health ---

#[tokio::test]
async fn test_health_check_lists_topics_when_connected() {
    let broker = InMemoryBroker::new();
    broker.create_topic(TOPIC);
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();

    let report = bus.health_check().await;

    assert!(report.is_healthy());
    assert_eq!(report.topics, vec![TOPIC.to_owned()]);
    assert!(report.error.is_none());
}

#[tokio::test]
async fn test_health_check_reports_disconnected() {
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);

    let report = bus.health_check().await;

    assert_eq!(report.state, ConnectionState::Disconnected);
    assert!(!report.connected);
    assert!(report.error.is_some());
}

// --- shutdown ---

#[tokio::test(start_paused = true)]
async fn test_disconnect_drains_in_flight_handler() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = make_bus(&broker);
    bus.connect().await.unwrap();
    let (handler, mut seen) = Forwarding::with_delay(0, Duration::from_secs(1));
    bus.subscribe(
        vec![TOPIC.to_owned()],
        handler,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();
    bus.publish(&make_event(Uuid::new_v4(), 1)).await.unwrap();
    next_event(&mut seen).await;

    // Act
    bus.disconnect().await.unwrap();

    // Assert
    assert_eq!(bus.state(), ConnectionState::Disconnected);
    assert_eq!(bus.metrics().committed, 1);
    assert_eq!(broker.committed_total(GROUP, TOPIC), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_aborts_handlers_past_drain_timeout() {
    // Arrange
    let broker = InMemoryBroker::new();
    let bus = EventBus::new(
        Arc::new(broker.clone()),
        BusConfig::default().with_drain_timeout(Duration::from_millis(100)),
    );
    bus.connect().await.unwrap();
    let (handler, mut seen) = Forwarding::with_delay(0, Duration::from_secs(60));
    bus.subscribe(
        vec![TOPIC.to_owned()],
        handler,
        SubscribeOptions::default().with_group_id(GROUP),
    )
    .await
    .unwrap();
    bus.publish(&make_event(Uuid::new_v4(), 1)).await.unwrap();
    next_event(&mut seen).await;
    let started = tokio::time::Instant::now();

    // Act
    bus.disconnect().await.unwrap();

    // Assert
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(bus.state(), ConnectionState::Disconnected);
    assert_eq!(bus.metrics().committed, 0);
    assert_eq!(broker.committed_total(GROUP, TOPIC), 0);
}
