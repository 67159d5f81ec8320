//! Notification classification
//!
//! Insert → `New`; an update flipping `active` → `StatusChanged`; an update
//! changing `price` → `PriceChanged`. An update doing both yields both.
//! Deletes and other updates yield nothing.

use super::NotificationKind;
use crate::cache::AppliedChange;
use crate::model::{ChangeKind, EntityId, Property, Version};

/// A notification before it gets an id and a slot in the queue
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    pub kind: NotificationKind,
    pub summary: String,
    pub entity_id: EntityId,
    pub version: Version,
}

impl NotificationDraft {
    fn new(kind: NotificationKind, current: &Property, summary: String) -> Self {
        Self {
            kind,
            summary,
            entity_id: current.id.clone(),
            version: current.version,
        }
    }
}

/// Drafts for an effective change, in the order they should be queued
pub fn classify(change: &AppliedChange) -> Vec<NotificationDraft> {
    let Some(current) = change.current.as_ref() else {
        return Vec::new();
    };

    match change.kind {
        ChangeKind::Insert => vec![NotificationDraft::new(
            NotificationKind::New,
            current,
            format!("New listing: {} at {}", current.title, format_price(current.price)),
        )],
        ChangeKind::Update => {
            let Some(previous) = change.previous.as_ref() else {
                return Vec::new();
            };

            let mut drafts = Vec::new();
            if previous.active != current.active {
                let state = if current.active { "active" } else { "inactive" };
                drafts.push(NotificationDraft::new(
                    NotificationKind::StatusChanged,
                    current,
                    format!("{} is now {}", current.title, state),
                ));
            }
            if previous.price != current.price {
                drafts.push(NotificationDraft::new(
                    NotificationKind::PriceChanged,
                    current,
                    format!(
                        "{} price changed from {} to {}",
                        current.title,
                        format_price(previous.price),
                        format_price(current.price)
                    ),
                ));
            }
            drafts
        }
        ChangeKind::Delete => Vec::new(),
    }
}

fn format_price(price: f64) -> String {
    if price.fract() == 0.0 {
        format!("{:.0}", price)
    } else {
        format!("{:.2}", price)
    }
}
