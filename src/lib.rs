//! listing-sync - real-time synchronization core for property listings
//!
//! Subscribes to a database change feed, keeps a version-reconciled cache of
//! listings, and derives a bounded queue of user notifications from the
//! changes that actually altered the cache.
//!
//! Data flow: change feed → [`SubscriptionManager`] → [`ChangeEvent`] →
//! [`StateReconciler`] → [`NotificationQueue`] → [`Dispatcher`].

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod feed;
pub mod model;
pub mod notify;
pub mod subscription;
pub mod types;

pub use cache::{PropertyQuery, StateReconciler};
pub use config::{Args, SyncConfig};
pub use dispatcher::{Dispatcher, EntityWatch};
pub use feed::{ChangeFeed, MemoryFeed, SnapshotSource, WebSocketFeed};
pub use model::{ChangeEvent, ChangeKind, EntityId, Property, RawChange, Version};
pub use notify::{Notification, NotificationKind, NotificationQueue};
pub use subscription::{
    Filter, Listener, SubscriptionHandle, SubscriptionKey, SubscriptionManager, SubscriptionStatus,
};
pub use types::{Result, SyncError};
