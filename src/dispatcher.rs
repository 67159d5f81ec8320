//! Consumer façade for one topic
//!
//! A [`Dispatcher`] keeps the topic's whole-collection subscription open for
//! its own lifetime and exposes the cache, the notification queue and the
//! connectivity status. Views that need a single listing's live state use
//! [`Dispatcher::watch_entity`], which joins that shared subscription
//! instead of opening one of their own.

use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cache::{PropertyQuery, ReconcilerStats};
use crate::model::{EntityId, Property};
use crate::notify::Notification;
use crate::subscription::{
    FeedUpdate, Filter, Listener, SubscriptionKey, SubscriptionManager, SubscriptionStatus,
    TopicState,
};
use crate::types::{Result, SyncError};

/// Consumer API bound to one topic
pub struct Dispatcher {
    manager: SubscriptionManager,
    topic: Arc<TopicState>,
    key: SubscriptionKey,
    status: watch::Receiver<SubscriptionStatus>,
    updates: broadcast::Sender<FeedUpdate>,
    stop: oneshot::Sender<()>,
    forward: JoinHandle<()>,
}

impl Dispatcher {
    /// Open the primary subscription for `topic`. Must run inside a tokio runtime.
    pub fn start(manager: SubscriptionManager, topic: &str) -> Self {
        let key = SubscriptionKey::all(topic);
        let state = manager.topic_state(topic);
        let primary = manager.subscribe(topic, Filter::All);
        let status = primary.status_receiver();
        let (updates, _) = broadcast::channel(256);
        let (stop_tx, stop_rx) = oneshot::channel();

        let forward = tokio::spawn(forward_updates(primary, updates.clone(), stop_rx));
        info!(topic = %topic, "Dispatcher started");

        Self {
            manager,
            topic: state,
            key,
            status,
            updates,
            stop: stop_tx,
            forward,
        }
    }

    pub fn topic(&self) -> &str {
        self.topic.topic()
    }

    pub fn manager(&self) -> &SubscriptionManager {
        &self.manager
    }

    // =========================================================================
    // Cache queries
    // =========================================================================

    /// Copy of the cached listing, if known
    pub async fn get_entity(&self, id: &EntityId) -> Option<Property> {
        self.topic.reconciler().get(id).await
    }

    /// Like [`get_entity`](Self::get_entity) but a missing id is an error
    pub async fn require_entity(&self, id: &EntityId) -> Result<Property> {
        self.get_entity(id)
            .await
            .ok_or_else(|| SyncError::NotFound(format!("{} in {}", id, self.topic())))
    }

    pub async fn list_entities(&self, query: &PropertyQuery) -> Vec<Property> {
        self.topic.reconciler().query(query).await
    }

    pub async fn list_where<F>(&self, predicate: F) -> Vec<Property>
    where
        F: Fn(&Property) -> bool,
    {
        self.topic.reconciler().list(predicate).await
    }

    /// Merge a full re-fetch into the cache
    pub async fn hydrate(&self, snapshot: Vec<Property>) -> usize {
        self.topic.hydrate(snapshot).await
    }

    pub async fn cache_stats(&self) -> ReconcilerStats {
        self.topic.reconciler().stats().await
    }

    /// Feed records dropped as unparseable
    pub fn malformed_count(&self) -> u64 {
        self.topic.malformed_count()
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Newest first
    pub async fn list_notifications(&self) -> Vec<Notification> {
        self.topic.notifications().list().await
    }

    pub async fn unread_count(&self) -> usize {
        self.topic.notifications().unread_count().await
    }

    pub async fn mark_read(&self, id: u64) -> bool {
        self.topic.notifications().mark_read(id).await
    }

    pub async fn mark_all_read(&self) -> usize {
        self.topic.notifications().mark_all_read().await
    }

    pub async fn clear(&self, id: u64) -> bool {
        self.topic.notifications().clear(id).await
    }

    pub async fn clear_all(&self) -> usize {
        self.topic.notifications().clear_all().await
    }

    /// Every notification created from now on
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.topic.notifications().subscribe()
    }

    // =========================================================================
    // Live updates and status
    // =========================================================================

    /// Connectivity of the primary subscription
    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SubscriptionStatus> {
        self.status.clone()
    }

    /// Set once reconnection has given up
    pub fn terminal_error(&self) -> Option<SyncError> {
        self.status.borrow().terminal_error(&self.key.topic)
    }

    /// Every update on the primary subscription, effective or not
    pub fn updates(&self) -> broadcast::Receiver<FeedUpdate> {
        self.updates.subscribe()
    }

    /// Listener on this topic with its own filter
    pub fn subscribe(&self, filter: Filter) -> Listener {
        self.manager.subscribe(&self.key.topic, filter)
    }

    /// Follow one listing through the shared whole-topic subscription
    pub fn watch_entity(&self, id: impl Into<EntityId>) -> EntityWatch {
        let id = id.into();
        debug!(topic = %self.key.topic, entity_id = %id, "Watching entity");
        EntityWatch {
            id,
            listener: self.manager.subscribe(&self.key.topic, Filter::All),
            topic: Arc::clone(&self.topic),
        }
    }

    /// Release the primary subscription and wait until it is let go.
    ///
    /// Other dispatchers and listeners on the same manager are untouched;
    /// use [`SubscriptionManager::shutdown`] to close everything.
    pub async fn shutdown(self) {
        info!(topic = %self.key.topic, "Dispatcher shutting down");
        // The forwarder may already have stopped
        let _ = self.stop.send(());
        if let Err(e) = self.forward.await {
            error!(topic = %self.key.topic, "Update forwarder failed: {}", e);
        }
    }
}

async fn forward_updates(
    mut primary: Listener,
    updates: broadcast::Sender<FeedUpdate>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            update = primary.recv() => match update {
                Some(update) => {
                    // No observers is fine
                    let _ = updates.send(update);
                }
                None => break,
            },
        }
    }
    debug!(key = %primary.key(), "Primary listener released");
}

/// Live view of one listing
pub struct EntityWatch {
    id: EntityId,
    listener: Listener,
    topic: Arc<TopicState>,
}

impl EntityWatch {
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Next update for this listing; `None` once the subscription is gone
    pub async fn next(&mut self) -> Option<FeedUpdate> {
        while let Some(update) = self.listener.recv().await {
            if update.event.entity_id == self.id {
                return Some(update);
            }
        }
        None
    }

    /// Current cached snapshot
    pub async fn current(&self) -> Option<Property> {
        self.topic.reconciler().get(&self.id).await
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.listener.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;
    use crate::model::RawChange;
    use crate::subscription::ManagerConfig;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn live_dispatcher() -> (Arc<MemoryFeed>, Dispatcher) {
        let feed = Arc::new(MemoryFeed::new());
        let manager = SubscriptionManager::new(feed.clone(), ManagerConfig::default());
        let dispatcher = Dispatcher::start(manager, "properties");
        let mut status = dispatcher.watch_status();
        timeout(Duration::from_secs(2), status.wait_for(|s| s.is_live()))
            .await
            .unwrap()
            .unwrap();
        (feed, dispatcher)
    }

    #[tokio::test]
    async fn test_get_and_require_entity() {
        let (feed, dispatcher) = live_dispatcher().await;
        let mut updates = dispatcher.updates();

        feed.publish(RawChange::insert(
            "properties",
            json!({ "id": "a", "title": "Loft", "price": 100, "version": 1 }),
        ));
        timeout(Duration::from_secs(2), updates.recv()).await.unwrap().unwrap();

        assert_eq!(dispatcher.get_entity(&"a".into()).await.unwrap().price, 100.0);
        assert!(dispatcher.get_entity(&"zz".into()).await.is_none());
        assert!(matches!(
            dispatcher.require_entity(&"zz".into()).await,
            Err(SyncError::NotFound(_))
        ));
        assert_eq!(dispatcher.unread_count().await, 1);
    }

    #[tokio::test]
    async fn test_watch_entity_reuses_primary_subscription() {
        let (feed, dispatcher) = live_dispatcher().await;
        let key = SubscriptionKey::all("properties");

        let mut watch = dispatcher.watch_entity("b");
        assert_eq!(dispatcher.manager().listener_count(&key), 2);
        assert_eq!(feed.open_count(&key), 1);

        feed.publish(RawChange::insert(
            "properties",
            json!({ "id": "a", "title": "Loft", "price": 100, "version": 1 }),
        ));
        feed.publish(RawChange::insert(
            "properties",
            json!({ "id": "b", "title": "Barn", "price": 70, "version": 1 }),
        ));

        let update = timeout(Duration::from_secs(2), watch.next()).await.unwrap().unwrap();
        assert_eq!(update.event.entity_id.as_str(), "b");
        assert_eq!(watch.current().await.unwrap().price, 70.0);

        drop(watch);
        assert_eq!(dispatcher.manager().listener_count(&key), 1);
    }

    #[tokio::test]
    async fn test_dropping_dispatcher_releases_subscription() {
        let (_feed, dispatcher) = live_dispatcher().await;
        let manager = dispatcher.manager().clone();
        let key = SubscriptionKey::all("properties");

        drop(dispatcher);
        timeout(Duration::from_secs(2), async {
            while manager.status(&key).is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_leaves_other_topics_running() {
        let feed = Arc::new(MemoryFeed::new());
        let manager = SubscriptionManager::new(feed.clone(), ManagerConfig::default());
        let properties = Dispatcher::start(manager.clone(), "properties");
        let agents = Dispatcher::start(manager.clone(), "agents");
        for dispatcher in [&properties, &agents] {
            let mut status = dispatcher.watch_status();
            timeout(Duration::from_secs(2), status.wait_for(|s| s.is_live()))
                .await
                .unwrap()
                .unwrap();
        }

        properties.shutdown().await;

        assert!(manager.status(&SubscriptionKey::all("properties")).is_none());
        assert_eq!(manager.active_subscriptions(), vec![SubscriptionKey::all("agents")]);
        assert!(agents.status().is_live());

        let mut updates = agents.updates();
        feed.publish(RawChange::insert(
            "agents",
            json!({ "id": "ag-1", "title": "Agent", "price": 0, "version": 1 }),
        ));
        let update = timeout(Duration::from_secs(2), updates.recv()).await.unwrap().unwrap();
        assert_eq!(update.event.entity_id.as_str(), "ag-1");
    }
}
