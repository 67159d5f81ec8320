//! In-process change feed
//!
//! Behaves like a remote realtime endpoint: every open channel first gets
//! `SUBSCRIBED`, then the changes published for its key. Failures can be
//! injected per topic, and history can be replayed on every (re)open to
//! simulate at-least-once redelivery.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ChangeFeed, FeedChannel, FeedMessage, FeedStatus};
use crate::model::RawChange;
use crate::subscription::SubscriptionKey;
use crate::types::{Result, SyncError};

/// Per-channel buffer; publishes beyond it are dropped with a warning
const CHANNEL_BUFFER: usize = 1024;

struct Connection {
    key: SubscriptionKey,
    tx: mpsc::Sender<FeedMessage>,
}

#[derive(Default)]
struct FeedState {
    connections: Vec<Connection>,
    /// Only recorded while replay is on
    history: Vec<RawChange>,
    /// Remaining opens to refuse, by topic
    refusals: HashMap<String, u32>,
    opens: HashMap<SubscriptionKey, u32>,
    replay_on_open: bool,
}

/// In-memory [`ChangeFeed`]
#[derive(Default)]
pub struct MemoryFeed {
    state: Mutex<FeedState>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replay every matching change published while replay is on after
    /// each `SUBSCRIBED`. Turning it off discards the recorded history.
    pub fn set_replay_on_open(&self, replay: bool) {
        let mut state = self.state();
        state.replay_on_open = replay;
        if !replay {
            state.history.clear();
        }
    }

    /// Deliver a change to every open channel whose key matches.
    ///
    /// Returns the number of channels it reached.
    pub fn publish(&self, change: RawChange) -> usize {
        let mut state = self.state();
        state.connections.retain(|conn| !conn.tx.is_closed());

        let mut delivered = 0;
        for conn in state.connections.iter().filter(|c| c.key.matches(&change)) {
            match conn.tx.try_send(FeedMessage::Change(change.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(key = %conn.key, error = %e, "Memory feed dropped a change"),
            }
        }
        if state.replay_on_open {
            state.history.push(change);
        }
        delivered
    }

    /// Send a raw status to every open channel on `topic` without closing it
    pub fn send_status(&self, topic: &str, status: FeedStatus) {
        let state = self.state();
        for conn in state.connections.iter().filter(|c| c.key.topic == topic) {
            let _ = conn.tx.try_send(FeedMessage::Status(status));
        }
    }

    /// Report `CHANNEL_ERROR` on every channel of `topic` and drop them
    pub fn fail_topic(&self, topic: &str) {
        self.terminate(topic, FeedStatus::ChannelError);
    }

    /// Report `CLOSED` on every channel of `topic` and drop them
    pub fn close_topic(&self, topic: &str) {
        self.terminate(topic, FeedStatus::Closed);
    }

    fn terminate(&self, topic: &str, status: FeedStatus) {
        let mut state = self.state();
        let (dropped, kept): (Vec<_>, Vec<_>) = state
            .connections
            .drain(..)
            .partition(|c| c.key.topic == topic);
        state.connections = kept;

        for conn in dropped {
            let _ = conn.tx.try_send(FeedMessage::Status(status));
        }
        debug!(topic, %status, "Memory feed terminated channels");
    }

    /// Refuse the next `count` opens for `topic`
    pub fn refuse_opens(&self, topic: &str, count: u32) {
        *self.state().refusals.entry(topic.to_string()).or_insert(0) += count;
    }

    /// How many times `key` was opened successfully
    pub fn open_count(&self, key: &SubscriptionKey) -> u32 {
        self.state().opens.get(key).copied().unwrap_or(0)
    }

    /// Channels on `topic` whose receiving side is still alive
    pub fn live_channels(&self, topic: &str) -> usize {
        self.state()
            .connections
            .iter()
            .filter(|c| c.key.topic == topic && !c.tx.is_closed())
            .count()
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn open(&self, key: &SubscriptionKey) -> Result<FeedChannel> {
        let mut state = self.state();

        if let Some(remaining) = state.refusals.get_mut(&key.topic) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::Transport(format!(
                    "connection refused for {}",
                    key
                )));
            }
        }

        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let _ = tx.try_send(FeedMessage::Status(FeedStatus::Subscribed));

        if state.replay_on_open {
            for change in state.history.iter().filter(|c| key.matches(c)) {
                let _ = tx.try_send(FeedMessage::Change(change.clone()));
            }
        }

        *state.opens.entry(key.clone()).or_insert(0) += 1;
        state.connections.push(Connection {
            key: key.clone(),
            tx,
        });

        debug!(%key, "Memory feed opened channel");
        Ok(FeedChannel::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_open_sends_subscribed_then_changes() {
        let feed = MemoryFeed::new();
        let key = SubscriptionKey::all("properties");
        let mut channel = feed.open(&key).await.unwrap();

        assert_eq!(feed.publish(RawChange::insert("properties", json!({ "id": "a", "version": 1 }))), 1);

        assert!(matches!(channel.recv().await, Some(FeedMessage::Status(FeedStatus::Subscribed))));
        assert!(matches!(channel.recv().await, Some(FeedMessage::Change(_))));
        assert_eq!(feed.open_count(&key), 1);
    }

    #[tokio::test]
    async fn test_refused_opens() {
        let feed = MemoryFeed::new();
        let key = SubscriptionKey::all("properties");
        feed.refuse_opens("properties", 2);

        assert!(feed.open(&key).await.is_err());
        assert!(feed.open(&key).await.is_err());
        assert!(feed.open(&key).await.is_ok());
        assert_eq!(feed.open_count(&key), 1);
    }

    #[tokio::test]
    async fn test_fail_topic_ends_channel() {
        let feed = MemoryFeed::new();
        let mut channel = feed.open(&SubscriptionKey::all("properties")).await.unwrap();
        let _ = channel.recv().await;

        feed.fail_topic("properties");

        assert!(matches!(channel.recv().await, Some(FeedMessage::Status(FeedStatus::ChannelError))));
        assert!(channel.recv().await.is_none());
        assert_eq!(feed.live_channels("properties"), 0);
    }

    #[tokio::test]
    async fn test_replay_on_open() {
        let feed = MemoryFeed::new();
        feed.set_replay_on_open(true);
        feed.publish(RawChange::insert("properties", json!({ "id": "a", "version": 1 })));
        feed.publish(RawChange::insert("properties", json!({ "id": "b", "version": 1 })));

        let mut channel = feed.open(&SubscriptionKey::entity("properties", "b")).await.unwrap();
        let _ = channel.recv().await;
        match channel.recv().await {
            Some(FeedMessage::Change(change)) => assert_eq!(change.entity_id().unwrap().as_str(), "b"),
            other => panic!("expected replayed change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_history_only_kept_while_replaying() {
        let feed = MemoryFeed::new();
        let key = SubscriptionKey::all("properties");
        feed.publish(RawChange::insert("properties", json!({ "id": "a", "version": 1 })));
        assert!(feed.state().history.is_empty());

        feed.set_replay_on_open(true);
        let mut channel = feed.open(&key).await.unwrap();
        assert!(matches!(channel.recv().await, Some(FeedMessage::Status(FeedStatus::Subscribed))));
        // Nothing published before replay was turned on comes back
        assert!(timeout(Duration::from_millis(50), channel.recv()).await.is_err());

        feed.set_replay_on_open(false);
        feed.publish(RawChange::insert("properties", json!({ "id": "b", "version": 1 })));
        assert!(feed.state().history.is_empty());
    }
}
