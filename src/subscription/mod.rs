//! Shared change-feed subscriptions
//!
//! One underlying feed channel exists per distinct [`SubscriptionKey`];
//! any number of local listeners share it. Each subscription runs as its
//! own task with its own [`ReconnectionSupervisor`], so a failing topic
//! never disturbs another.

pub mod listener;
pub mod manager;
pub mod supervisor;
pub mod topic;

pub use listener::{FeedUpdate, Listener, SubscriptionHandle};
pub use manager::{ManagerConfig, SubscriptionManager};
pub use supervisor::{BackoffPolicy, ReconnectionSupervisor};
pub use topic::TopicState;

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::model::{EntityId, RawChange};
use crate::types::SyncError;

/// Which rows of a topic a subscription covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Filter {
    All,
    Entity(EntityId),
}

impl Filter {
    pub fn matches(&self, id: &EntityId) -> bool {
        match self {
            Self::All => true,
            Self::Entity(wanted) => wanted == id,
        }
    }

    /// Row filter in the feed's `column=eq.value` syntax
    pub fn to_feed_filter(&self) -> Option<String> {
        match self {
            Self::All => None,
            Self::Entity(id) => Some(format!("id=eq.{}", id)),
        }
    }
}

/// Identity of one underlying subscription: collection plus row filter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionKey {
    pub topic: String,
    pub filter: Filter,
}

impl SubscriptionKey {
    pub fn new(topic: impl Into<String>, filter: Filter) -> Self {
        Self {
            topic: topic.into(),
            filter,
        }
    }

    pub fn all(topic: impl Into<String>) -> Self {
        Self::new(topic, Filter::All)
    }

    pub fn entity(topic: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self::new(topic, Filter::Entity(id.into()))
    }

    /// Whether a feed record belongs on this subscription
    pub fn matches(&self, raw: &RawChange) -> bool {
        if !raw.table.is_empty() && raw.table != self.topic {
            return false;
        }
        match &self.filter {
            Filter::All => true,
            Filter::Entity(_) => raw
                .entity_id()
                .map(|id| self.filter.matches(&id))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Filter::All => write!(f, "{}:*", self.topic),
            Filter::Entity(id) => write!(f, "{}:{}", self.topic, id),
        }
    }
}

/// Why a subscription stopped for good
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// The last listener went away or the manager shut down
    Unsubscribed,
    /// Reconnection gave up
    Exhausted { attempts: u32 },
}

/// Connectivity state of one subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SubscriptionStatus {
    Connecting,
    Live,
    /// Connection lost; the next attempt starts after `retry_in`
    Degraded { attempt: u32, retry_in: Duration },
    Closed { reason: CloseReason },
}

impl SubscriptionStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// The user-visible error for a subscription that gave up
    pub fn terminal_error(&self, topic: &str) -> Option<SyncError> {
        match self {
            Self::Closed {
                reason: CloseReason::Exhausted { attempts },
            } => Some(SyncError::SubscriptionExhausted {
                topic: topic.to_string(),
                attempts: *attempts,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Live => f.write_str("live"),
            Self::Degraded { attempt, retry_in } => {
                write!(f, "degraded (attempt {}, retry in {:?})", attempt, retry_in)
            }
            Self::Closed {
                reason: CloseReason::Unsubscribed,
            } => f.write_str("closed"),
            Self::Closed {
                reason: CloseReason::Exhausted { .. },
            } => f.write_str("live updates unavailable"),
        }
    }
}

/// Status transition broadcast by the manager
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub key: SubscriptionKey,
    pub status: SubscriptionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_matching() {
        let all = SubscriptionKey::all("properties");
        let one = SubscriptionKey::entity("properties", "a");

        let change_a = RawChange::insert("properties", json!({ "id": "a", "version": 1 }));
        let change_b = RawChange::insert("properties", json!({ "id": "b", "version": 1 }));
        let other_table = RawChange::insert("agents", json!({ "id": "a", "version": 1 }));

        assert!(all.matches(&change_a));
        assert!(all.matches(&change_b));
        assert!(one.matches(&change_a));
        assert!(!one.matches(&change_b));
        assert!(!all.matches(&other_table));
    }

    #[test]
    fn test_feed_filter_syntax() {
        assert_eq!(Filter::All.to_feed_filter(), None);
        assert_eq!(
            Filter::Entity("p-9".into()).to_feed_filter(),
            Some("id=eq.p-9".to_string())
        );
    }

    #[test]
    fn test_terminal_error_only_when_exhausted() {
        let exhausted = SubscriptionStatus::Closed {
            reason: CloseReason::Exhausted { attempts: 4 },
        };
        let closed = SubscriptionStatus::Closed {
            reason: CloseReason::Unsubscribed,
        };

        assert!(exhausted.terminal_error("properties").is_some());
        assert!(closed.terminal_error("properties").is_none());
        assert!(SubscriptionStatus::Live.terminal_error("properties").is_none());
        assert_eq!(exhausted.to_string(), "live updates unavailable");
    }

    #[test]
    fn test_key_display() {
        assert_eq!(SubscriptionKey::all("properties").to_string(), "properties:*");
        assert_eq!(SubscriptionKey::entity("properties", "x").to_string(), "properties:x");
    }
}
