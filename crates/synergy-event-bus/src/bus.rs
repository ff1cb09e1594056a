//! Event bus client.
//!
//! `EventBus` publishes committed events and delivers them to subscribers
//! through a `BrokerTransport`. It owns the connection state machine: an
//! unexpected session loss triggers reconnect attempts with exponential
//! backoff, after which every registered subscription joins its group again.
//! When the attempts run out the bus enters `Failed` and every call returns
//! `BusError::Failed` until `connect()` succeeds.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::OwnedPermit;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use synergy_core::event_store::StoredEvent;

use crate::config::BusConfig;
use crate::error::BusError;
use crate::state::{ConnectionState, HealthReport};
use crate::transport::{
    BrokerSession, BrokerTransport, ConsumerChannel, Delivery, HEADER_CORRELATION_ID,
    HEADER_EVENT_ID, HEADER_EVENT_TYPE, InboundRecord, OutboundRecord,
};

/// Error type returned by event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer callback. Must be idempotent by event id: delivery is at least
/// once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. An error or a panic leaves the offset
    /// uncommitted; the worker moves on to the next record.
    async fn handle(&self, event: StoredEvent) -> Result<(), HandlerError>;
}

/// Options for [`EventBus::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Consumer group. Defaults to `<prefix>-<topics joined by '-'>`.
    pub group_id: Option<String>,
}

impl SubscribeOptions {
    /// Sets the consumer group.
    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }
}

/// Counters kept by the bus.
#[derive(Debug, Default)]
pub struct BusMetrics {
    published: AtomicU64,
    publish_failures: AtomicU64,
    delivered: AtomicU64,
    committed: AtomicU64,
    handler_failures: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`BusMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Records acknowledged by the broker.
    pub published: u64,
    /// Publish calls that failed or timed out.
    pub publish_failures: u64,
    /// Records handed to a partition worker.
    pub delivered: u64,
    /// Offsets committed after a successful handler.
    pub committed: u64,
    /// Handler errors, handler panics and undecodable records.
    pub handler_failures: u64,
    /// Successful reconnects.
    pub reconnects: u64,
}

impl BusMetrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

struct Subscription {
    id: Uuid,
    topics: Vec<String>,
    group_id: String,
    handler: Arc<dyn EventHandler>,
    token: CancellationToken,
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: Uuid,
    group_id: String,
    token: CancellationToken,
    bus: Weak<Inner>,
}

impl SubscriptionHandle {
    /// Subscription identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Consumer group the subscription joined.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Stops the workers and forgets the subscription, so it is not
    /// re-established on reconnect. In-flight handlers run to completion.
    pub fn unsubscribe(self) {
        self.token.cancel();
        if let Some(inner) = self.bus.upgrade() {
            lock(&inner.subscriptions).remove(&self.id);
        }
        tracing::info!(subscription = %self.id, "Unsubscribed");
    }
}

#[derive(Clone)]
struct Live {
    session: Arc<dyn BrokerSession>,
    token: CancellationToken,
}

struct Inner {
    transport: Arc<dyn BrokerTransport>,
    config: BusConfig,
    state: watch::Sender<ConnectionState>,
    live: RwLock<Option<Live>>,
    lifetime: Mutex<CancellationToken>,
    lifecycle: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<HashMap<Uuid, Arc<Subscription>>>,
    workers: TaskTracker,
    aborts: Mutex<Vec<AbortHandle>>,
    failed_attempts: AtomicU32,
    metrics: BusMetrics,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("state", &*self.state.borrow())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type PartitionKey = (String, i32);

type FreedSlot = BoxFuture<
    'static,
    (
        PartitionKey,
        Result<OwnedPermit<InboundRecord>, SendError<()>>,
    ),
>;

/// Resolves once the worker behind `sender` has room for one more record.
fn wait_for_slot(key: PartitionKey, sender: mpsc::Sender<InboundRecord>) -> FreedSlot {
    async move { (key, sender.reserve_owned().await) }.boxed()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

/// Either of two tokens; workers stop when their session or their
/// subscription ends.
#[derive(Clone)]
struct WorkerScope {
    session: CancellationToken,
    subscription: CancellationToken,
}

impl WorkerScope {
    async fn stopped(&self) {
        tokio::select! {
            () = self.session.cancelled() => {}
            () = self.subscription.cancelled() => {}
        }
    }
}

/// Broker client with reconnection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Creates a disconnected bus.
    #[must_use]
    pub fn new(transport: Arc<dyn BrokerTransport>, config: BusConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state,
                live: RwLock::new(None),
                lifetime: Mutex::new(CancellationToken::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                supervisor: Mutex::new(None),
                subscriptions: Mutex::new(HashMap::new()),
                workers: TaskTracker::new(),
                aborts: Mutex::new(Vec::new()),
                failed_attempts: AtomicU32::new(0),
                metrics: BusMetrics::default(),
            }),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Bus configuration.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Opens a session. A no-op when already connected or reconnecting.
    /// From `Failed` this is the manual recovery path; registered
    /// subscriptions are re-established.
    ///
    /// # Errors
    ///
    /// Returns the transport error and stays `Disconnected` when the broker
    /// is unreachable.
    pub async fn connect(&self) -> Result<(), BusError> {
        let _guard = self.inner.lifecycle.lock().await;
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Reconnecting { .. }
        ) {
            return Ok(());
        }

        self.inner.set_state(ConnectionState::Connecting);
        let session = match self.inner.transport.open().await {
            Ok(session) => session,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                tracing::warn!(error = %e, "Broker connection failed");
                return Err(e);
            }
        };

        let lifetime = CancellationToken::new();
        lock(&self.inner.lifetime).cancel();
        *lock(&self.inner.lifetime) = lifetime.clone();
        self.inner.failed_attempts.store(0, Ordering::Relaxed);

        let session_token = Arc::clone(&self.inner)
            .install(Arc::clone(&session), &lifetime)
            .await;
        let supervisor = tokio::spawn(Arc::clone(&self.inner).supervise(
            lifetime,
            session,
            session_token,
        ));
        if let Some(previous) = lock(&self.inner.supervisor).replace(supervisor) {
            previous.abort();
        }
        tracing::info!("Event bus connected");
        Ok(())
    }

    /// Tears down: stops reconnecting, cancels workers, waits up to the
    /// drain timeout for in-flight handlers, aborts the rest and closes the
    /// session. Subscriptions are forgotten. Always ends `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns the error from closing the session, after teardown finished.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        let _guard = self.inner.lifecycle.lock().await;
        let drain_timeout = self.inner.config.drain_timeout;

        lock(&self.inner.lifetime).cancel();
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(mut supervisor) = supervisor {
            if tokio::time::timeout(drain_timeout, &mut supervisor)
                .await
                .is_err()
            {
                supervisor.abort();
            }
        }

        for (_, subscription) in lock(&self.inner.subscriptions).drain() {
            subscription.token.cancel();
        }

        self.inner.workers.close();
        if tokio::time::timeout(drain_timeout, self.inner.workers.wait())
            .await
            .is_err()
        {
            let aborted = {
                let mut aborts = lock(&self.inner.aborts);
                let count = aborts.len();
                for handle in aborts.drain(..) {
                    handle.abort();
                }
                count
            };
            tracing::warn!(
                aborted,
                timeout_ms = millis(drain_timeout),
                "Drain timed out, aborting in-flight handlers"
            );
            self.inner.workers.wait().await;
        }
        lock(&self.inner.aborts).clear();
        self.inner.workers.reopen();

        let live = self
            .inner
            .live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let result = match live {
            Some(live) => live.session.close().await,
            None => Ok(()),
        };
        self.inner.set_state(ConnectionState::Disconnected);
        tracing::info!("Event bus disconnected");
        result
    }

    /// Waits for Ctrl-C or SIGTERM, then disconnects.
    ///
    /// # Errors
    ///
    /// See [`EventBus::disconnect`].
    pub async fn shutdown_on_signal(&self) -> Result<(), BusError> {
        wait_for_signal().await;
        self.disconnect().await
    }

    /// Publishes `event` to `<prefix>.<aggregate_type>.events`, keyed by its
    /// stream id, and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `BusError::NotConnected` or `BusError::Failed` without a
    /// session, `BusError::Timeout` when no acknowledgement arrives within
    /// the publish timeout, and transport errors otherwise.
    pub async fn publish(&self, event: &StoredEvent) -> Result<Delivery, BusError> {
        let session = self.inner.session()?;
        let topic = self.inner.config.topic_for(event.aggregate_type());
        let record = OutboundRecord {
            topic: topic.clone(),
            key: event.stream_id.clone(),
            headers: envelope_headers(event),
            payload: serde_json::to_vec(event)?,
        };

        let outcome =
            tokio::time::timeout(self.inner.config.publish_timeout, session.produce(record)).await;
        match outcome {
            Ok(Ok(delivery)) => {
                BusMetrics::incr(&self.inner.metrics.published);
                tracing::debug!(
                    topic = %topic,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Published event"
                );
                Ok(delivery)
            }
            Ok(Err(e)) => {
                BusMetrics::incr(&self.inner.metrics.publish_failures);
                tracing::warn!(topic = %topic, event_id = %event.id, error = %e, "Publish failed");
                Err(e)
            }
            Err(_) => {
                BusMetrics::incr(&self.inner.metrics.publish_failures);
                tracing::warn!(topic = %topic, event_id = %event.id, "Publish timed out");
                Err(BusError::Timeout { topic })
            }
        }
    }

    /// Joins a consumer group for `topics` and delivers every record to
    /// `handler`, one worker per partition. Offsets are committed only
    /// after the handler succeeds.
    ///
    /// # Errors
    ///
    /// Returns `BusError::NotConnected` or `BusError::Failed` without a
    /// session, `BusError::Configuration` for an empty topic list, and the
    /// transport error when joining fails.
    pub async fn subscribe(
        &self,
        topics: Vec<String>,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BusError> {
        if topics.is_empty() {
            return Err(BusError::Configuration("no topics to subscribe to".into()));
        }
        let live = self.inner.live()?;
        let group_id = options.group_id.unwrap_or_else(|| {
            format!("{}-{}", self.inner.config.topic_prefix, topics.join("-"))
        });
        let subscription = Arc::new(Subscription {
            id: Uuid::new_v4(),
            topics,
            group_id,
            handler,
            token: CancellationToken::new(),
        });

        lock(&self.inner.subscriptions).insert(subscription.id, Arc::clone(&subscription));
        if let Err(e) = self
            .inner
            .start_workers(&subscription, &live.session, &live.token)
            .await
        {
            lock(&self.inner.subscriptions).remove(&subscription.id);
            subscription.token.cancel();
            return Err(e);
        }

        tracing::info!(
            subscription = %subscription.id,
            group_id = %subscription.group_id,
            topics = ?subscription.topics,
            "Subscribed"
        );
        Ok(SubscriptionHandle {
            id: subscription.id,
            group_id: subscription.group_id.clone(),
            token: subscription.token.clone(),
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Reports state, connectivity and the broker's topics.
    pub async fn health_check(&self) -> HealthReport {
        let state = self.state();
        let listing = match self.inner.session() {
            Ok(session) => {
                tokio::time::timeout(self.inner.config.publish_timeout, session.list_topics())
                    .await
                    .unwrap_or_else(|_| {
                        Err(BusError::Timeout {
                            topic: "<metadata>".into(),
                        })
                    })
            }
            Err(e) => Err(e),
        };
        match listing {
            Ok(topics) => HealthReport {
                state,
                connected: true,
                topics,
                error: None,
            },
            Err(e) => HealthReport {
                state,
                connected: false,
                topics: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

fn envelope_headers(event: &StoredEvent) -> Vec<(String, String)> {
    let mut headers = vec![
        (HEADER_EVENT_ID.to_owned(), event.id.to_string()),
        (HEADER_EVENT_TYPE.to_owned(), event.event_type.clone()),
    ];
    if let Some(correlation_id) = event.metadata.correlation_id {
        headers.push((HEADER_CORRELATION_ID.to_owned(), correlation_id.to_string()));
    }
    headers
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    fn live(&self) -> Result<Live, BusError> {
        if *self.state.borrow() == ConnectionState::Failed {
            return Err(BusError::Failed {
                attempts: self.failed_attempts.load(Ordering::Relaxed),
            });
        }
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BusError::NotConnected)
    }

    fn session(&self) -> Result<Arc<dyn BrokerSession>, BusError> {
        self.live().map(|live| live.session)
    }

    /// Makes `session` current and restarts every registered subscription
    /// on it. Returns the token that stops this session's workers.
    async fn install(
        self: Arc<Self>,
        session: Arc<dyn BrokerSession>,
        lifetime: &CancellationToken,
    ) -> CancellationToken {
        let token = lifetime.child_token();
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = Some(Live {
            session: Arc::clone(&session),
            token: token.clone(),
        });
        self.set_state(ConnectionState::Connected);

        let subscriptions: Vec<Arc<Subscription>> =
            lock(&self.subscriptions).values().cloned().collect();
        for subscription in subscriptions {
            match self.start_workers(&subscription, &session, &token).await {
                Ok(()) => tracing::info!(
                    subscription = %subscription.id,
                    group_id = %subscription.group_id,
                    "Re-established subscription"
                ),
                Err(e) => tracing::error!(
                    subscription = %subscription.id,
                    error = %e,
                    "Failed to re-establish subscription"
                ),
            }
        }
        token
    }

    async fn supervise(
        self: Arc<Self>,
        lifetime: CancellationToken,
        mut session: Arc<dyn BrokerSession>,
        mut session_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = lifetime.cancelled() => return,
                () = session.lost() => {}
            }
            session_token.cancel();
            *self.live.write().unwrap_or_else(PoisonError::into_inner) = None;
            tracing::warn!("Broker session lost");

            let Some(next) = self.reconnect(&lifetime).await else {
                return;
            };
            session_token = Arc::clone(&self).install(Arc::clone(&next), &lifetime).await;
            session = next;
        }
    }

    async fn reconnect(&self, lifetime: &CancellationToken) -> Option<Arc<dyn BrokerSession>> {
        let policy = &self.config.reconnect;
        for attempt in 1..=policy.max_attempts {
            self.set_state(ConnectionState::Reconnecting { attempt });
            let delay = policy.delay_for_attempt(attempt);
            tokio::select! {
                () = lifetime.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            let opened = tokio::select! {
                () = lifetime.cancelled() => return None,
                opened = self.transport.open() => opened,
            };
            match opened {
                Ok(session) => {
                    BusMetrics::incr(&self.metrics.reconnects);
                    tracing::info!(attempt, "Reconnected to broker");
                    return Some(session);
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = millis(delay),
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }
        }

        self.failed_attempts
            .store(policy.max_attempts, Ordering::Relaxed);
        self.set_state(ConnectionState::Failed);
        tracing::error!(
            attempts = policy.max_attempts,
            "Reconnect attempts exhausted, event bus failed"
        );
        None
    }

    async fn start_workers(
        self: &Arc<Self>,
        subscription: &Arc<Subscription>,
        session: &Arc<dyn BrokerSession>,
        session_token: &CancellationToken,
    ) -> Result<(), BusError> {
        let channel: Arc<dyn ConsumerChannel> = Arc::from(
            session
                .join_group(&subscription.group_id, &subscription.topics)
                .await?,
        );
        let scope = WorkerScope {
            session: session_token.clone(),
            subscription: subscription.token.clone(),
        };
        self.spawn_worker(Arc::clone(self).dispatch(
            Arc::clone(subscription),
            channel,
            scope,
        ));
        Ok(())
    }

    fn spawn_worker<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = self.workers.spawn(task);
        let mut aborts = lock(&self.aborts);
        aborts.retain(|h| !h.is_finished());
        aborts.push(handle.abort_handle());
    }

    /// Polls the group and routes each record to its partition's worker.
    /// A partition whose buffer is full is paused on the channel and its
    /// overflow parked until the worker frees a slot, so one slow partition
    /// does not hold up the others.
    async fn dispatch(
        self: Arc<Self>,
        subscription: Arc<Subscription>,
        channel: Arc<dyn ConsumerChannel>,
        scope: WorkerScope,
    ) {
        let mut partitions: HashMap<PartitionKey, mpsc::Sender<InboundRecord>> = HashMap::new();
        let mut parked: HashMap<PartitionKey, VecDeque<InboundRecord>> = HashMap::new();
        let mut freed: FuturesUnordered<FreedSlot> = FuturesUnordered::new();
        loop {
            tokio::select! {
                () = scope.stopped() => break,
                Some((key, permit)) = freed.next(), if !freed.is_empty() => {
                    let Ok(permit) = permit else { break };
                    let Some(queue) = parked.get_mut(&key) else { continue };
                    if let Some(record) = queue.pop_front() {
                        permit.send(record);
                    }
                    if queue.is_empty() {
                        parked.remove(&key);
                        if let Err(e) = channel.resume(&key.0, key.1) {
                            tracing::warn!(
                                subscription = %subscription.id,
                                topic = %key.0,
                                partition = key.1,
                                error = %e,
                                "Resuming partition failed"
                            );
                        }
                    } else if let Some(sender) = partitions.get(&key) {
                        freed.push(wait_for_slot(key, sender.clone()));
                    }
                }
                polled = channel.poll() => {
                    let record = match polled {
                        Ok(record) => record,
                        Err(e) if e.is_connection_error() => {
                            tracing::debug!(
                                subscription = %subscription.id,
                                error = %e,
                                "Consumer channel closed"
                            );
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(subscription = %subscription.id, error = %e, "Poll failed");
                            continue;
                        }
                    };

                    let key = (record.topic.clone(), record.partition);
                    if let Some(queue) = parked.get_mut(&key) {
                        queue.push_back(record);
                        continue;
                    }
                    let sender = partitions.entry(key.clone()).or_insert_with(|| {
                        let (tx, rx) = mpsc::channel(self.config.partition_buffer.max(1));
                        self.spawn_worker(Arc::clone(&self).run_partition(
                            Arc::clone(&subscription),
                            Arc::clone(&channel),
                            scope.clone(),
                            rx,
                        ));
                        tx
                    });
                    match sender.try_send(record) {
                        Ok(()) => {}
                        Err(TrySendError::Full(record)) => {
                            if let Err(e) = channel.pause(&key.0, key.1) {
                                tracing::warn!(
                                    subscription = %subscription.id,
                                    topic = %key.0,
                                    partition = key.1,
                                    error = %e,
                                    "Pausing partition failed"
                                );
                            }
                            tracing::debug!(
                                subscription = %subscription.id,
                                topic = %key.0,
                                partition = key.1,
                                "Partition buffer full, paused"
                            );
                            freed.push(wait_for_slot(key.clone(), sender.clone()));
                            parked.insert(key, VecDeque::from([record]));
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
    }

    /// Handles one partition's records in order. Checks for cancellation
    /// only between records, so an in-flight handler finishes.
    async fn run_partition(
        self: Arc<Self>,
        subscription: Arc<Subscription>,
        channel: Arc<dyn ConsumerChannel>,
        scope: WorkerScope,
        mut records: mpsc::Receiver<InboundRecord>,
    ) {
        loop {
            let record = tokio::select! {
                biased;
                () = scope.stopped() => break,
                next = records.recv() => match next {
                    Some(record) => record,
                    None => break,
                },
            };
            self.deliver(&subscription, &*channel, record).await;
        }
    }

    async fn deliver(
        &self,
        subscription: &Subscription,
        channel: &dyn ConsumerChannel,
        record: InboundRecord,
    ) {
        BusMetrics::incr(&self.metrics.delivered);
        let event: StoredEvent = match serde_json::from_slice(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                BusMetrics::incr(&self.metrics.handler_failures);
                tracing::error!(
                    subscription = %subscription.id,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Undecodable event envelope"
                );
                return;
            }
        };
        let event_id = event.id;
        let event_type = event.event_type.clone();

        match AssertUnwindSafe(subscription.handler.handle(event))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                BusMetrics::incr(&self.metrics.handler_failures);
                tracing::error!(
                    subscription = %subscription.id,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    event_id = %event_id,
                    event_type = %event_type,
                    error = %e,
                    "Event handler failed"
                );
                return;
            }
            Err(panic) => {
                BusMetrics::incr(&self.metrics.handler_failures);
                tracing::error!(
                    subscription = %subscription.id,
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    event_id = %event_id,
                    event_type = %event_type,
                    panic = %panic_message(panic.as_ref()),
                    "Event handler panicked"
                );
                return;
            }
        }

        match channel.commit(&record).await {
            Ok(()) => BusMetrics::incr(&self.metrics.committed),
            Err(e) => tracing::warn!(
                subscription = %subscription.id,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Offset commit failed, event will be redelivered"
            ),
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
