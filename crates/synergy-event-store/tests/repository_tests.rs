//! Repository behavior against the in-memory store.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use synergy_core::aggregate::Aggregate;
use synergy_core::error::DomainError;
use synergy_core::event::EventMetadata;
use synergy_core::event_store::{AggregateStore, EventStore, NewEvent, stream_id};
use synergy_core::repository::Repository;
use synergy_core::snapshot::{EveryNEvents, NeverSnapshot, SnapshotStore};
use synergy_event_store::InMemoryEventStore;
use synergy_test_support::{
    Counter, FailingStore, FixedClock, RecordingStore, SteppingClock, StoreCall,
};
use uuid::Uuid;

fn fixed_clock() -> FixedClock {
    FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap())
}

fn repository(store: &Arc<InMemoryEventStore>) -> Repository<Counter> {
    Repository::new(Arc::clone(store) as Arc<dyn AggregateStore>)
}

#[tokio::test]
async fn test_save_then_load_round_trips_state_and_version() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let clock = fixed_clock();
    let id = Uuid::new_v4();
    let mut counter = Counter::new(id);
    counter.open("visits", &clock).unwrap();
    counter.increment(3, &clock).unwrap();

    // Act
    let stored = repo.save(&mut counter).await.unwrap();
    let loaded = repo.load(id).await.unwrap();

    // Assert
    assert_eq!(stored.len(), 2);
    assert!(counter.uncommitted_events().is_empty());
    assert_eq!(loaded.version(), 2);
    assert_eq!(loaded.state(), counter.state());
    assert!(loaded.uncommitted_events().is_empty());
}

#[tokio::test]
async fn test_save_without_uncommitted_events_is_noop() {
    // Arrange
    let inner = Arc::new(InMemoryEventStore::new());
    let recording = Arc::new(RecordingStore::new(inner));
    let repo: Repository<Counter> =
        Repository::new(Arc::clone(&recording) as Arc<dyn AggregateStore>);
    let mut counter = Counter::new(Uuid::new_v4());

    // Act
    let stored = repo.save(&mut counter).await.unwrap();

    // Assert
    assert!(stored.is_empty());
    assert!(recording.calls().is_empty());
}

#[tokio::test]
async fn test_stale_save_conflicts_and_succeeds_after_reload() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let clock = fixed_clock();
    let id = Uuid::new_v4();

    let mut first = Counter::new(id);
    first.open("orders", &clock).unwrap();
    first.increment(1, &clock).unwrap();
    repo.save(&mut first).await.unwrap();

    let mut stale = Counter::new(id);
    stale.open("orders", &clock).unwrap();

    // Act
    let conflict = repo.save(&mut stale).await;

    let mut fresh = repo.load(id).await.unwrap();
    fresh.increment(5, &clock).unwrap();
    let stored = repo.save(&mut fresh).await.unwrap();

    // Assert
    match conflict.unwrap_err() {
        DomainError::ConcurrencyConflict {
            expected, actual, ..
        } => {
            assert_eq!(expected, 0);
            assert_eq!(actual, 2);
        }
        other => panic!("expected ConcurrencyConflict, got {other:?}"),
    }
    assert_eq!(stale.uncommitted_events().len(), 1);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].version, 3);
    assert_eq!(fresh.version(), 3);
}

#[tokio::test]
async fn test_load_replays_only_events_after_snapshot() {
    // Arrange
    let inner = Arc::new(InMemoryEventStore::new());
    let recording = Arc::new(RecordingStore::new(inner));
    let repo: Repository<Counter> =
        Repository::new(Arc::clone(&recording) as Arc<dyn AggregateStore>)
            .with_snapshot_policy(Arc::new(EveryNEvents::new(5)));
    let clock = fixed_clock();
    let id = Uuid::new_v4();

    let mut counter = Counter::new(id);
    counter.open("clicks", &clock).unwrap();
    for _ in 0..4 {
        counter.increment(1, &clock).unwrap();
    }
    repo.save(&mut counter).await.unwrap();
    for _ in 0..3 {
        counter.increment(10, &clock).unwrap();
    }
    repo.save(&mut counter).await.unwrap();
    recording.clear();

    // Act
    let loaded = repo.load(id).await.unwrap();

    // Assert
    let snapshot = recording.load(id).await.unwrap().unwrap();
    assert_eq!(snapshot.version, 5);
    assert!(recording.calls().contains(&StoreCall::GetEvents {
        stream_id: stream_id("counter", id),
        from_version: 6,
    }));
    assert_eq!(loaded.version(), 8);
    assert_eq!(loaded.state().total, 34);
}

#[tokio::test]
async fn test_snapshot_policy_does_not_change_loaded_state() {
    // Arrange
    let clock = fixed_clock();
    let id = Uuid::new_v4();
    let with_snapshots = Arc::new(InMemoryEventStore::new());
    let without_snapshots = Arc::new(InMemoryEventStore::new());
    let snapshotting = repository(&with_snapshots);
    let replaying =
        repository(&without_snapshots).with_snapshot_policy(Arc::new(NeverSnapshot));

    for repo in [&snapshotting, &replaying] {
        let mut counter = Counter::new(id);
        counter.open("signups", &clock).unwrap();
        repo.save(&mut counter).await.unwrap();
        counter.increment(2, &clock).unwrap();
        counter.increment(7, &clock).unwrap();
        repo.save(&mut counter).await.unwrap();
    }

    // Act
    let a = snapshotting.load(id).await.unwrap();
    let b = replaying.load(id).await.unwrap();

    // Assert
    assert!(with_snapshots.load(id).await.unwrap().is_some());
    assert!(without_snapshots.load(id).await.unwrap().is_none());
    assert_eq!(a.version(), b.version());
    assert_eq!(a.state(), b.state());
}

#[tokio::test]
async fn test_get_by_id_returns_none_for_unknown_aggregate() {
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);

    let result = repo.get_by_id(Uuid::new_v4()).await.unwrap();

    assert!(result.is_none());
}

#[tokio::test]
async fn test_load_unknown_aggregate_is_not_found() {
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let id = Uuid::new_v4();

    let result = repo.load(id).await;

    assert!(matches!(result, Err(DomainError::AggregateNotFound(found)) if found == id));
}

#[tokio::test]
async fn test_get_by_id_and_version_reconstructs_past_state() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let clock = fixed_clock();
    let id = Uuid::new_v4();
    let mut counter = Counter::new(id);
    counter.open("balance", &clock).unwrap();
    counter.increment(4, &clock).unwrap();
    counter.increment(6, &clock).unwrap();
    repo.save(&mut counter).await.unwrap();

    // Act
    let past = repo.get_by_id_and_version(id, 2).await.unwrap().unwrap();

    // Assert
    assert_eq!(past.version(), 2);
    assert_eq!(past.state().total, 4);
    assert_eq!(counter.state().total, 10);
}

#[tokio::test]
async fn test_unknown_event_type_aborts_load() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let id = Uuid::new_v4();
    store
        .save_events(
            &stream_id("counter", id),
            vec![NewEvent {
                id: Uuid::new_v4(),
                event_type: "CounterExploded".into(),
                aggregate_id: id,
                payload: serde_json::json!({}),
                metadata: EventMetadata::new("tests"),
                occurred_at: Utc::now(),
            }],
            0,
        )
        .await
        .unwrap();

    // Act
    let result = repo.get_by_id(id).await;

    // Assert
    assert!(matches!(result, Err(DomainError::UnknownEventType(t)) if t == "CounterExploded"));
}

#[tokio::test]
async fn test_undecodable_payload_aborts_load() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let id = Uuid::new_v4();
    store
        .save_events(
            &stream_id("counter", id),
            vec![NewEvent {
                id: Uuid::new_v4(),
                event_type: "CounterIncremented".into(),
                aggregate_id: id,
                payload: serde_json::json!({"amount": "lots"}),
                metadata: EventMetadata::new("tests"),
                occurred_at: Utc::now(),
            }],
            0,
        )
        .await
        .unwrap();

    // Act
    let result = repo.get_by_id(id).await;

    // Assert
    assert!(matches!(result, Err(DomainError::Serialization(_))));
}

#[tokio::test]
async fn test_terminal_state_survives_reload() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let clock = fixed_clock();
    let id = Uuid::new_v4();
    let mut counter = Counter::new(id);
    counter.open("trial", &clock).unwrap();
    counter.close(&clock).unwrap();
    repo.save(&mut counter).await.unwrap();

    // Act
    let mut loaded = repo.load(id).await.unwrap();
    let result = loaded.increment(1, &clock);

    // Assert
    assert!(matches!(result, Err(DomainError::AggregateTerminated(found)) if found == id));
    assert!(loaded.uncommitted_events().is_empty());
}

#[tokio::test]
async fn test_event_timestamps_come_from_clock() {
    // Arrange
    let store = Arc::new(InMemoryEventStore::new());
    let repo = repository(&store);
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
    let clock = SteppingClock::new(start, Duration::seconds(30));
    let id = Uuid::new_v4();
    let mut counter = Counter::new(id);
    counter.open("ticks", &clock).unwrap();
    counter.increment(1, &clock).unwrap();

    // Act
    let stored = repo.save(&mut counter).await.unwrap();

    // Assert
    assert_eq!(stored[0].occurred_at, start);
    assert_eq!(stored[1].occurred_at, start + Duration::seconds(30));
}

#[tokio::test]
async fn test_storage_failure_propagates_and_keeps_uncommitted_events() {
    // Arrange
    let repo: Repository<Counter> = Repository::new(Arc::new(FailingStore));
    let clock = fixed_clock();
    let mut counter = Counter::new(Uuid::new_v4());
    counter.open("offline", &clock).unwrap();

    // Act
    let result = repo.save(&mut counter).await;

    // Assert
    let err = result.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(counter.uncommitted_events().len(), 1);
}
