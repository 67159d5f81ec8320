//! Bounded notification queue
//!
//! Keeps at most `capacity` notifications, evicting the oldest on overflow.
//! `unread` is maintained on every mutation rather than recomputed; it always
//! equals the number of entries with `read == false`.

use std::collections::VecDeque;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{classify, Notification, NotificationKind};
use crate::cache::AppliedChange;
use crate::model::{EntityId, Version};

/// Notification queue configuration
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// Maximum notifications retained
    pub capacity: usize,
    /// Buffer for the new-notification broadcast
    pub broadcast_buffer: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            broadcast_buffer: 64,
        }
    }
}

impl NotificationConfig {
    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        let capacity = std::env::var("NOTIFICATION_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        Self {
            capacity,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// Oldest at the front
    items: VecDeque<Notification>,
    unread: usize,
    next_id: u64,
}

impl QueueState {
    fn is_duplicate(&self, entity_id: &EntityId, kind: NotificationKind, version: Version) -> bool {
        self.items
            .iter()
            .any(|n| n.kind == kind && n.version == version && &n.related_entity_id == entity_id)
    }

    fn evict_overflow(&mut self, capacity: usize) {
        while self.items.len() > capacity {
            if let Some(evicted) = self.items.pop_front() {
                if !evicted.read {
                    self.unread -= 1;
                }
                debug!(id = evicted.id, "Evicted oldest notification");
            }
        }
    }
}

/// Bounded, read-tracked list of notifications
pub struct NotificationQueue {
    state: RwLock<QueueState>,
    config: NotificationConfig,
    tx: broadcast::Sender<Notification>,
}

impl NotificationQueue {
    pub fn new(config: NotificationConfig) -> Self {
        let (tx, _) = broadcast::channel(config.broadcast_buffer.max(1));
        Self {
            state: RwLock::new(QueueState {
                next_id: 1,
                ..Default::default()
            }),
            config,
            tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(NotificationConfig::default())
    }

    /// Receive every notification created from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Derive notifications from an effective change.
    ///
    /// Must only be called for changes the reconciler applied. A notification
    /// matching one still queued (same entity, kind and version) is skipped.
    pub async fn on_effective_change(&self, change: &AppliedChange) -> Vec<Notification> {
        let drafts = classify(change);
        if drafts.is_empty() {
            return Vec::new();
        }

        let mut created = Vec::with_capacity(drafts.len());
        {
            let mut state = self.state.write().await;
            for draft in drafts {
                if state.is_duplicate(&draft.entity_id, draft.kind, draft.version) {
                    debug!(entity_id = %draft.entity_id, kind = ?draft.kind, "Duplicate notification skipped");
                    continue;
                }

                let notification = Notification {
                    id: state.next_id,
                    kind: draft.kind,
                    summary: draft.summary,
                    related_entity_id: draft.entity_id,
                    version: draft.version,
                    created_at: Utc::now(),
                    read: false,
                };
                state.next_id += 1;
                state.unread += 1;
                state.items.push_back(notification.clone());
                state.evict_overflow(self.config.capacity);
                created.push(notification);
            }
        }

        for notification in &created {
            debug!(id = notification.id, summary = %notification.summary, "Notification created");
            // No receivers is fine
            let _ = self.tx.send(notification.clone());
        }
        created
    }

    /// Newest first
    pub async fn list(&self) -> Vec<Notification> {
        self.state.read().await.items.iter().rev().cloned().collect()
    }

    pub async fn unread_count(&self) -> usize {
        self.state.read().await.unread
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Mark one notification read. Returns false if it is not queued.
    pub async fn mark_read(&self, id: u64) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(notification) = state.items.iter_mut().find(|n| n.id == id) else {
            return false;
        };
        if !notification.read {
            notification.read = true;
            state.unread -= 1;
        }
        true
    }

    /// Mark everything read; returns how many changed
    pub async fn mark_all_read(&self) -> usize {
        let mut state = self.state.write().await;
        let mut marked = 0;
        for notification in state.items.iter_mut().filter(|n| !n.read) {
            notification.read = true;
            marked += 1;
        }
        state.unread = 0;
        marked
    }

    /// Remove one notification. Returns false if it is not queued.
    pub async fn clear(&self, id: u64) -> bool {
        let mut state = self.state.write().await;
        let Some(pos) = state.items.iter().position(|n| n.id == id) else {
            return false;
        };
        if let Some(removed) = state.items.remove(pos) {
            if !removed.read {
                state.unread -= 1;
            }
        }
        true
    }

    /// Remove everything; returns how many were removed
    pub async fn clear_all(&self) -> usize {
        let mut state = self.state.write().await;
        let removed = state.items.len();
        state.items.clear();
        state.unread = 0;
        removed
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::with_defaults()
    }
}
