//! User-facing notifications derived from effective cache changes
//!
//! - [`classify`]: which changes deserve a notification, and its wording
//! - [`queue`]: the bounded, read-tracked notification list

pub mod classify;
pub mod queue;

pub use classify::{classify, NotificationDraft};
pub use queue::{NotificationConfig, NotificationQueue};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EntityId, Version};

/// What a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A listing was inserted
    New,
    /// A listing's active flag flipped
    StatusChanged,
    /// A listing's price changed
    PriceChanged,
}

/// A user-facing notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Monotonic id, unique within the queue's lifetime
    pub id: u64,
    pub kind: NotificationKind,
    pub summary: String,
    pub related_entity_id: EntityId,
    /// Version of the snapshot that produced it
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}
