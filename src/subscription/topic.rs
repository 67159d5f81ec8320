//! Per-topic state shared by every subscription on the topic

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::debug;

use crate::cache::{ApplyOutcome, CacheConfig, StateReconciler};
use crate::model::{ChangeEvent, Property};
use crate::notify::{NotificationConfig, NotificationQueue};

/// Cache and notification queue for one topic.
///
/// Every change for the topic goes through [`TopicState::ingest`], which
/// holds the ingest lock across reconcile and notify so events are applied
/// one at a time even when several subscriptions feed the same topic.
pub struct TopicState {
    topic: String,
    reconciler: StateReconciler,
    notifications: NotificationQueue,
    ingest_lock: Mutex<()>,
    malformed: AtomicU64,
}

impl TopicState {
    pub fn new(
        topic: impl Into<String>,
        cache: CacheConfig,
        notifications: NotificationConfig,
    ) -> Self {
        Self {
            topic: topic.into(),
            reconciler: StateReconciler::new(cache),
            notifications: NotificationQueue::new(notifications),
            ingest_lock: Mutex::new(()),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn reconciler(&self) -> &StateReconciler {
        &self.reconciler
    }

    pub fn notifications(&self) -> &NotificationQueue {
        &self.notifications
    }

    /// Reconcile one event; notify if it changed the cache
    pub async fn ingest(&self, event: &ChangeEvent) -> ApplyOutcome {
        let _guard = self.ingest_lock.lock().await;
        let outcome = self.reconciler.apply(event).await;
        match outcome.applied() {
            Some(change) => {
                self.notifications.on_effective_change(change).await;
            }
            None => {
                debug!(topic = %self.topic, outcome = ?outcome, "Change had no effect");
            }
        }
        outcome
    }

    /// Merge a snapshot into the cache without notifying
    pub async fn hydrate(&self, snapshot: Vec<Property>) -> usize {
        let _guard = self.ingest_lock.lock().await;
        self.reconciler.hydrate(snapshot).await
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Feed records dropped because they could not be parsed
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> TopicState {
        TopicState::new("properties", CacheConfig::default(), NotificationConfig::default())
    }

    #[tokio::test]
    async fn test_ingest_notifies_only_effective_changes() {
        let topic = state();
        let event = ChangeEvent::insert(Property::new("a", "Loft", 100.0, 1));

        assert!(topic.ingest(&event).await.is_effective());
        assert!(!topic.ingest(&event).await.is_effective());
        assert_eq!(topic.notifications().len().await, 1);
    }

    #[tokio::test]
    async fn test_hydrate_is_silent() {
        let topic = state();
        let loaded = topic
            .hydrate(vec![Property::new("a", "Loft", 100.0, 1)])
            .await;

        assert_eq!(loaded, 1);
        assert!(topic.notifications().is_empty().await);
        assert!(topic.reconciler().get(&"a".into()).await.is_some());
    }
}
