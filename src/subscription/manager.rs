//! Subscription manager
//!
//! Owns every underlying feed channel. Listeners asking for the same
//! `(topic, filter)` share one channel; the channel opens with the first
//! listener and closes when the last one is released. Each channel runs in
//! its own task that reconnects through a [`ReconnectionSupervisor`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::listener::{FeedUpdate, Listener, ListenerId, ListenerSet, SubscriptionHandle};
use super::supervisor::{BackoffPolicy, ReconnectionSupervisor};
use super::topic::TopicState;
use super::{CloseReason, Filter, StatusEvent, SubscriptionKey, SubscriptionStatus};
use crate::cache::CacheConfig;
use crate::feed::{ChangeFeed, FeedChannel, FeedMessage, SnapshotSource};
use crate::model::{ChangeEvent, Property, RawChange};
use crate::notify::NotificationConfig;
use crate::types::Result;

/// Subscription manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub backoff: BackoffPolicy,
    pub cache: CacheConfig,
    pub notifications: NotificationConfig,
    /// Buffer for the status-transition broadcast
    pub status_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            cache: CacheConfig::default(),
            notifications: NotificationConfig::default(),
            status_buffer: 256,
        }
    }
}

impl ManagerConfig {
    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        Self {
            backoff: BackoffPolicy::from_env(),
            cache: CacheConfig::from_env(),
            notifications: NotificationConfig::from_env(),
            ..Default::default()
        }
    }
}

/// One live underlying subscription
struct SubscriptionEntry {
    listeners: Arc<ListenerSet>,
    status: watch::Receiver<SubscriptionStatus>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl SubscriptionEntry {
    fn stop(&self) {
        // The task may already have exited on exhaustion
        let _ = self.shutdown_tx.send(());
    }
}

pub(crate) struct ManagerInner {
    feed: Arc<dyn ChangeFeed>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    config: ManagerConfig,
    subscriptions: DashMap<SubscriptionKey, SubscriptionEntry>,
    /// Tasks of released subscriptions that may still hold a feed channel
    draining: DashMap<SubscriptionKey, JoinHandle<()>>,
    topics: DashMap<String, Arc<TopicState>>,
    status_tx: broadcast::Sender<StatusEvent>,
    next_listener: AtomicU64,
    shut_down: AtomicBool,
}

impl ManagerInner {
    fn topic(&self, topic: &str) -> Arc<TopicState> {
        let state = self.topics.entry(topic.to_string()).or_insert_with(|| {
            Arc::new(TopicState::new(
                topic,
                self.config.cache.clone(),
                self.config.notifications.clone(),
            ))
        });
        Arc::clone(&state)
    }

    /// Drop one listener; tear the subscription down if it was the last.
    ///
    /// The stopped task is parked in `draining` under the same shard lock,
    /// so a subscribe racing with the release always finds it.
    pub(crate) fn release(&self, key: &SubscriptionKey, id: ListenerId) {
        let Entry::Occupied(occupied) = self.subscriptions.entry(key.clone()) else {
            debug!(key = %key, listener = id, "Listener released after subscription closed");
            return;
        };

        occupied.get().listeners.remove(id);
        if !occupied.get().listeners.is_empty() {
            debug!(key = %key, listener = id, "Listener released");
            return;
        }

        let (key, entry) = occupied.remove_entry();
        info!(key = %key, "Last listener released, closing subscription");
        entry.stop();
        self.draining.retain(|_, task| !task.is_finished());
        self.draining.insert(key, entry.task);
    }

    /// Called by a task that gave up; removes its entry unless a newer
    /// subscription already took the key
    fn retire(&self, key: &SubscriptionKey, listeners: &Arc<ListenerSet>) {
        let removed = self
            .subscriptions
            .remove_if(key, |_, entry| Arc::ptr_eq(&entry.listeners, listeners));
        if removed.is_some() {
            debug!(key = %key, "Exhausted subscription removed");
        }
    }

    fn spawn_subscription(
        self: &Arc<Self>,
        key: SubscriptionKey,
        topic: Arc<TopicState>,
    ) -> SubscriptionEntry {
        let predecessor = self.draining.remove(&key).map(|(_, task)| task);
        let (status_tx, status_rx) = watch::channel(SubscriptionStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let listeners = Arc::new(ListenerSet::default());

        let snapshots = match key.filter {
            Filter::All => self.snapshots.clone(),
            Filter::Entity(_) => None,
        };

        let task = SubscriptionTask {
            key,
            feed: Arc::clone(&self.feed),
            snapshots,
            topic,
            listeners: Arc::clone(&listeners),
            status_tx,
            events_tx: self.status_tx.clone(),
            supervisor: ReconnectionSupervisor::new(self.config.backoff.clone()),
            manager: Arc::downgrade(self),
        };

        SubscriptionEntry {
            listeners,
            status: status_rx,
            shutdown_tx,
            task: tokio::spawn(task.run(predecessor, shutdown_rx)),
        }
    }
}

/// Shared, reference-counted change-feed subscriptions.
///
/// Cheap to clone; clones share the same subscriptions and topic state.
/// [`subscribe`](Self::subscribe) spawns tasks and must be called from
/// within a tokio runtime.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, config: ManagerConfig) -> Self {
        Self::build(feed, None, config)
    }

    /// Re-fetch the full topic on every (re)subscribe of a whole-topic
    /// subscription, merging the result into the cache
    pub fn with_snapshot_source(
        feed: Arc<dyn ChangeFeed>,
        snapshots: Arc<dyn SnapshotSource>,
        config: ManagerConfig,
    ) -> Self {
        Self::build(feed, Some(snapshots), config)
    }

    fn build(
        feed: Arc<dyn ChangeFeed>,
        snapshots: Option<Arc<dyn SnapshotSource>>,
        config: ManagerConfig,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(config.status_buffer.max(1));
        Self {
            inner: Arc::new(ManagerInner {
                feed,
                snapshots,
                config,
                subscriptions: DashMap::new(),
                draining: DashMap::new(),
                topics: DashMap::new(),
                status_tx,
                next_listener: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Register a listener on `(topic, filter)`.
    ///
    /// Opens the underlying channel if this is the first listener for the
    /// key; otherwise joins the existing one. After [`shutdown`](Self::shutdown)
    /// the returned listener is already closed.
    pub fn subscribe(&self, topic: &str, filter: Filter) -> Listener {
        let key = SubscriptionKey::new(topic, filter);
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SubscriptionHandle::new(key.clone(), id, Arc::downgrade(&self.inner));

        if self.inner.shut_down.load(Ordering::Acquire) {
            warn!(key = %key, "Subscribe after shutdown");
            let (_, status) = watch::channel(SubscriptionStatus::Closed {
                reason: CloseReason::Unsubscribed,
            });
            return Listener::new(handle, rx, status);
        }

        let topic_state = self.inner.topic(topic);
        let entry = self
            .inner
            .subscriptions
            .entry(key.clone())
            .or_insert_with(|| {
                info!(key = %key, "Opening subscription");
                self.inner.spawn_subscription(key.clone(), topic_state)
            });
        entry.listeners.add(id, tx);
        let status = entry.status.clone();
        debug!(key = %key, listener = id, listeners = entry.listeners.len(), "Listener registered");
        drop(entry);

        Listener::new(handle, rx, status)
    }

    /// Register a callback on `(topic, filter)`.
    ///
    /// The handler runs on its own task, once per delivered update and in
    /// delivery order, until the returned handle is dropped.
    pub fn subscribe_with<F>(&self, topic: &str, filter: Filter, mut handler: F) -> SubscriptionHandle
    where
        F: FnMut(FeedUpdate) + Send + 'static,
    {
        let (handle, mut events) = self.subscribe(topic, filter).into_parts();
        tokio::spawn(async move {
            while let Some(update) = events.recv().await {
                handler(update);
            }
        });
        handle
    }

    /// Release a listener; same as dropping its handle
    pub fn unsubscribe(&self, listener: Listener) {
        drop(listener);
    }

    /// Cache and notifications for a topic, created on first use
    pub fn topic_state(&self, topic: &str) -> Arc<TopicState> {
        self.inner.topic(topic)
    }

    /// Current status of an open subscription
    pub fn status(&self, key: &SubscriptionKey) -> Option<SubscriptionStatus> {
        self.inner
            .subscriptions
            .get(key)
            .map(|entry| entry.status.borrow().clone())
    }

    /// Watch an open subscription's status
    pub fn watch_status(&self, key: &SubscriptionKey) -> Option<watch::Receiver<SubscriptionStatus>> {
        self.inner
            .subscriptions
            .get(key)
            .map(|entry| entry.status.clone())
    }

    /// Every status transition of every subscription
    pub fn status_events(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status_tx.subscribe()
    }

    pub fn listener_count(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .subscriptions
            .get(key)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.inner
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Close every subscription and wait for their tasks to finish.
    ///
    /// Existing listeners see their streams end; later subscribes return
    /// closed listeners.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);

        let keys = self.active_subscriptions();
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((key, entry)) = self.inner.subscriptions.remove(&key) {
                debug!(key = %key, "Stopping subscription");
                entry.stop();
                tasks.push(entry.task);
            }
        }

        let draining: Vec<SubscriptionKey> =
            self.inner.draining.iter().map(|entry| entry.key().clone()).collect();
        for key in draining {
            if let Some((_, task)) = self.inner.draining.remove(&key) {
                tasks.push(task);
            }
        }

        for task in tasks {
            if let Err(e) = task.await {
                error!("Subscription task failed: {}", e);
            }
        }
        info!("Subscription manager stopped");
    }
}

// =============================================================================
// Subscription task
// =============================================================================

/// How a feed channel ended
enum ChannelExit {
    Shutdown,
    Dropped(String),
}

struct SubscriptionTask {
    key: SubscriptionKey,
    feed: Arc<dyn ChangeFeed>,
    snapshots: Option<Arc<dyn SnapshotSource>>,
    topic: Arc<TopicState>,
    listeners: Arc<ListenerSet>,
    status_tx: watch::Sender<SubscriptionStatus>,
    events_tx: broadcast::Sender<StatusEvent>,
    supervisor: ReconnectionSupervisor,
    manager: Weak<ManagerInner>,
}

impl SubscriptionTask {
    async fn run(
        mut self,
        predecessor: Option<JoinHandle<()>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        // A released task for the same key must close its channel first
        if let Some(previous) = predecessor {
            debug!(key = %self.key, "Waiting for previous subscription to close");
            if let Err(e) = previous.await {
                error!(key = %self.key, "Previous subscription task failed: {}", e);
            }
        }

        loop {
            self.set_status(SubscriptionStatus::Connecting);

            let opened = tokio::select! {
                _ = shutdown_rx.recv() => break,
                opened = self.feed.open(&self.key) => opened,
            };

            let reason = match opened {
                Ok(channel) => match self.listen(channel, &mut shutdown_rx).await {
                    ChannelExit::Shutdown => break,
                    ChannelExit::Dropped(reason) => reason,
                },
                Err(e) => e.to_string(),
            };

            match self.supervisor.on_failure() {
                Some(delay) => {
                    let attempt = self.supervisor.attempt();
                    warn!(
                        key = %self.key,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Subscription lost: {}",
                        reason
                    );
                    self.set_status(SubscriptionStatus::Degraded {
                        attempt,
                        retry_in: delay,
                    });

                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown_rx.recv() => {
                            info!(key = %self.key, "Shutdown received during reconnect wait");
                            break;
                        }
                    }
                }
                None => {
                    // The first failure was the drop itself, not a reconnect
                    let attempts = self.supervisor.attempt().saturating_sub(1);
                    error!(
                        key = %self.key,
                        attempts,
                        "Reconnection attempts exhausted, live updates unavailable: {}",
                        reason
                    );
                    self.set_status(SubscriptionStatus::Closed {
                        reason: CloseReason::Exhausted { attempts },
                    });
                    if let Some(manager) = self.manager.upgrade() {
                        manager.retire(&self.key, &self.listeners);
                    }
                    let closed = self.listeners.close();
                    debug!(key = %self.key, listeners = closed, "Listener streams closed");
                    return;
                }
            }
        }

        self.set_status(SubscriptionStatus::Closed {
            reason: CloseReason::Unsubscribed,
        });
        info!(key = %self.key, "Subscription stopped");
    }

    async fn listen(
        &mut self,
        mut channel: FeedChannel,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> ChannelExit {
        loop {
            let message = tokio::select! {
                _ = shutdown_rx.recv() => return ChannelExit::Shutdown,
                message = channel.recv() => message,
            };

            match message {
                Some(FeedMessage::Status(status)) if status.is_failure() => {
                    return ChannelExit::Dropped(format!("feed reported {}", status));
                }
                Some(FeedMessage::Status(_)) => {
                    self.supervisor.on_success();
                    self.set_status(SubscriptionStatus::Live);

                    if let Some(source) = self.snapshots.clone() {
                        tokio::select! {
                            _ = shutdown_rx.recv() => return ChannelExit::Shutdown,
                            fetched = source.fetch_all(&self.key.topic) => self.resync(fetched).await,
                        }
                    }
                }
                Some(FeedMessage::Change(raw)) => self.deliver(&raw).await,
                None => return ChannelExit::Dropped("feed channel ended".to_string()),
            }
        }
    }

    async fn resync(&self, fetched: Result<Vec<Property>>) {
        match fetched {
            Ok(snapshot) => {
                let installed = self.topic.hydrate(snapshot).await;
                debug!(key = %self.key, installed, "Resynced after subscribe");
            }
            Err(e) => warn!(key = %self.key, "Snapshot re-fetch failed: {}", e),
        }
    }

    async fn deliver(&self, raw: &RawChange) {
        if !self.key.matches(raw) {
            debug!(key = %self.key, table = %raw.table, "Ignoring change outside subscription");
            return;
        }

        let event = match ChangeEvent::from_raw(raw) {
            Ok(event) => event,
            Err(e) => {
                self.topic.record_malformed();
                warn!(key = %self.key, "Dropping malformed change: {}", e);
                return;
            }
        };

        let outcome = self.topic.ingest(&event).await;
        let update = FeedUpdate {
            event,
            effective: outcome.is_effective(),
        };
        let delivered = self.listeners.fan_out(&update);
        debug!(
            key = %self.key,
            entity_id = %update.event.entity_id,
            version = update.event.version().map(|v| v.0),
            effective = update.effective,
            delivered,
            "Change delivered"
        );
    }

    fn set_status(&self, status: SubscriptionStatus) {
        if *self.status_tx.borrow() == status {
            return;
        }
        debug!(key = %self.key, status = %status, "Subscription status changed");
        self.status_tx.send_replace(status.clone());
        // No observers is fine
        let _ = self.events_tx.send(StatusEvent {
            key: self.key.clone(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn manager(feed: &Arc<MemoryFeed>) -> SubscriptionManager {
        SubscriptionManager::new(feed.clone(), ManagerConfig::default())
    }

    fn fast_config(max_attempts: Option<u32>) -> ManagerConfig {
        ManagerConfig {
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(25),
                jitter: 0.0,
                max_attempts,
            },
            ..Default::default()
        }
    }

    async fn wait_live(listener: &Listener) {
        let mut status = listener.status_receiver();
        timeout(Duration::from_secs(2), status.wait_for(|s| s.is_live()))
            .await
            .expect("timed out waiting for live")
            .expect("status sender dropped");
    }

    #[tokio::test]
    async fn test_listeners_share_one_channel() {
        let feed = Arc::new(MemoryFeed::new());
        let manager = manager(&feed);
        let key = SubscriptionKey::all("properties");

        let first = manager.subscribe("properties", Filter::All);
        let second = manager.subscribe("properties", Filter::All);
        wait_live(&first).await;

        assert_eq!(manager.listener_count(&key), 2);
        assert_eq!(manager.active_subscriptions(), vec![key.clone()]);
        assert_eq!(feed.open_count(&key), 1);

        drop(first);
        assert_eq!(manager.listener_count(&key), 1);
        drop(second);
        assert!(manager.status(&key).is_none());
        assert!(manager.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_change_reaches_every_listener_once() {
        let feed = Arc::new(MemoryFeed::new());
        let manager = manager(&feed);

        let mut first = manager.subscribe("properties", Filter::All);
        let mut second = manager.subscribe("properties", Filter::All);
        wait_live(&first).await;

        feed.publish(RawChange::insert(
            "properties",
            json!({ "id": "a", "title": "Loft", "price": 100, "version": 1 }),
        ));

        let a = timeout(Duration::from_secs(2), first.recv()).await.unwrap().unwrap();
        let b = timeout(Duration::from_secs(2), second.recv()).await.unwrap().unwrap();
        assert!(a.effective);
        assert_eq!(a, b);
        assert!(first.try_recv().is_none());

        let state = manager.topic_state("properties");
        assert_eq!(state.notifications().len().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_change_is_dropped() {
        let feed = Arc::new(MemoryFeed::new());
        let manager = manager(&feed);
        let mut listener = manager.subscribe("properties", Filter::All);
        wait_live(&listener).await;

        feed.publish(RawChange::insert("properties", json!({ "title": "no id" })));
        feed.publish(RawChange::insert(
            "properties",
            json!({ "id": "b", "title": "Barn", "price": 5, "version": 1 }),
        ));

        let update = timeout(Duration::from_secs(2), listener.recv()).await.unwrap().unwrap();
        assert_eq!(update.event.entity_id.as_str(), "b");
        assert_eq!(manager.topic_state("properties").malformed_count(), 1);
    }

    #[tokio::test]
    async fn test_entity_filter_only_sees_its_row() {
        let feed = Arc::new(MemoryFeed::new());
        let manager = manager(&feed);
        let mut listener = manager.subscribe("properties", Filter::Entity("b".into()));
        wait_live(&listener).await;

        feed.publish(RawChange::insert(
            "properties",
            json!({ "id": "a", "title": "Loft", "price": 1, "version": 1 }),
        ));
        feed.publish(RawChange::insert(
            "properties",
            json!({ "id": "b", "title": "Barn", "price": 2, "version": 1 }),
        ));

        let update = timeout(Duration::from_secs(2), listener.recv()).await.unwrap().unwrap();
        assert_eq!(update.event.entity_id.as_str(), "b");
    }

    #[tokio::test]
    async fn test_shutdown_closes_listeners() {
        let feed = Arc::new(MemoryFeed::new());
        let manager = manager(&feed);
        let mut listener = manager.subscribe("properties", Filter::All);
        wait_live(&listener).await;

        manager.shutdown().await;
        assert!(listener.recv().await.is_none());
        assert!(manager.active_subscriptions().is_empty());

        let late = manager.subscribe("properties", Filter::All);
        assert!(late.status().is_closed());
    }

    struct FixedSnapshot(Vec<Property>);

    #[async_trait::async_trait]
    impl SnapshotSource for FixedSnapshot {
        async fn fetch_all(&self, _topic: &str) -> Result<Vec<Property>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_snapshot_hydrates_after_subscribe() {
        let feed = Arc::new(MemoryFeed::new());
        let snapshot = Arc::new(FixedSnapshot(vec![
            Property::new("a", "Loft", 100.0, 3),
            Property::new("b", "Barn", 50.0, 1),
        ]));
        let manager =
            SubscriptionManager::with_snapshot_source(feed.clone(), snapshot, ManagerConfig::default());
        let state = manager.topic_state("properties");

        let _listener = manager.subscribe("properties", Filter::All);
        timeout(Duration::from_secs(2), async {
            while state.reconciler().len().await < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("snapshot never applied");

        assert!(state.notifications().is_empty().await);

        // Older than the hydrated version
        feed.publish(RawChange::update(
            "properties",
            json!({ "id": "a" }),
            json!({ "id": "a", "title": "Loft", "price": 80, "version": 2 }),
        ));
        feed.publish(RawChange::insert(
            "properties",
            json!({ "id": "c", "title": "Cabin", "price": 10, "version": 1 }),
        ));
        timeout(Duration::from_secs(2), async {
            while state.reconciler().len().await < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(state.reconciler().get(&"a".into()).await.unwrap().price, 100.0);
    }

    /// Hands out each snapshot in turn, then repeats the last one
    struct ShrinkingSnapshot(std::sync::Mutex<Vec<Vec<Property>>>);

    #[async_trait::async_trait]
    impl SnapshotSource for ShrinkingSnapshot {
        async fn fetch_all(&self, _topic: &str) -> Result<Vec<Property>> {
            let mut snapshots = self.0.lock().unwrap();
            if snapshots.len() > 1 {
                Ok(snapshots.remove(0))
            } else {
                Ok(snapshots[0].clone())
            }
        }
    }

    #[tokio::test]
    async fn test_resync_drops_rows_deleted_while_disconnected() {
        let feed = Arc::new(MemoryFeed::new());
        let snapshot = Arc::new(ShrinkingSnapshot(std::sync::Mutex::new(vec![
            vec![Property::new("a", "Loft", 100.0, 2), Property::new("b", "Barn", 50.0, 1)],
            vec![Property::new("a", "Loft", 100.0, 2)],
        ])));
        let manager = SubscriptionManager::with_snapshot_source(feed.clone(), snapshot, fast_config(None));
        let state = manager.topic_state("properties");

        let _listener = manager.subscribe("properties", Filter::All);
        timeout(Duration::from_secs(2), async {
            while state.reconciler().len().await < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first snapshot never applied");

        // "b" is deleted server-side while the channel is down
        feed.fail_topic("properties");
        timeout(Duration::from_secs(2), async {
            while state.reconciler().get(&"b".into()).await.is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("deleted row survived the resync");

        assert_eq!(state.reconciler().len().await, 1);
        assert!(state.reconciler().get(&"a".into()).await.is_some());
    }

    #[tokio::test]
    async fn test_exhaustion_ends_listener_streams() {
        let feed = Arc::new(MemoryFeed::new());
        let manager = SubscriptionManager::new(feed.clone(), fast_config(Some(1)));
        let key = SubscriptionKey::all("properties");
        let mut listener = manager.subscribe("properties", Filter::All);
        wait_live(&listener).await;

        feed.refuse_opens("properties", 1);
        feed.fail_topic("properties");

        let end = timeout(Duration::from_secs(2), listener.recv()).await.expect("stream never ended");
        assert!(end.is_none());
        assert_eq!(
            listener.status(),
            SubscriptionStatus::Closed {
                reason: CloseReason::Exhausted { attempts: 1 }
            }
        );
        assert!(manager.status(&key).is_none());
        assert!(manager.active_subscriptions().is_empty());

        // A fresh subscribe starts over
        let again = manager.subscribe("properties", Filter::All);
        wait_live(&again).await;
        assert_eq!(manager.listener_count(&key), 1);

        drop(listener);
        assert_eq!(manager.listener_count(&key), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_waits_for_released_channel() {
        let feed = Arc::new(MemoryFeed::new());
        let manager = manager(&feed);
        let key = SubscriptionKey::all("properties");
        let mut events = manager.status_events();

        let first = manager.subscribe("properties", Filter::All);
        wait_live(&first).await;
        drop(first);
        let second = manager.subscribe("properties", Filter::All);
        wait_live(&second).await;

        let mut closed_before_live = false;
        loop {
            let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
            match event.status {
                SubscriptionStatus::Closed { .. } => closed_before_live = true,
                SubscriptionStatus::Live if closed_before_live => break,
                _ => {}
            }
        }

        assert!(closed_before_live);
        assert_eq!(feed.open_count(&key), 2);
        assert_eq!(feed.live_channels("properties"), 1);
        assert_eq!(manager.active_subscriptions(), vec![key]);
    }

    #[tokio::test]
    async fn test_handler_runs_until_handle_dropped() {
        let feed = Arc::new(MemoryFeed::new());
        let manager = manager(&feed);
        let key = SubscriptionKey::all("properties");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = manager.subscribe_with("properties", Filter::All, move |update| {
            let _ = tx.send(update.event.entity_id);
        });
        let mut status = manager.watch_status(&key).unwrap();
        timeout(Duration::from_secs(2), status.wait_for(|s| s.is_live()))
            .await
            .unwrap()
            .unwrap();

        feed.publish(RawChange::insert(
            "properties",
            json!({ "id": "a", "title": "Loft", "price": 1, "version": 1 }),
        ));
        let seen = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(seen.as_str(), "a");

        handle.unsubscribe();
        assert!(manager.status(&key).is_none());
        assert!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_none());
    }
}
