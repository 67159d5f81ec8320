//! Change events
//!
//! [`RawChange`] is the record exactly as the change feed sends it.
//! [`ChangeEvent`] is the validated form the rest of the crate works with:
//! an `Insert` never has a `before`, a `Delete` never has an `after`, and an
//! `Update` always has both.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::property::{parse_timestamp, EntityId, Property, Version};
use crate::types::{Result, SyncError};

/// Kind of mutation carried by a change event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl FromStr for ChangeKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(SyncError::MalformedEvent(format!(
                "unknown event_type '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("INSERT"),
            Self::Update => f.write_str("UPDATE"),
            Self::Delete => f.write_str("DELETE"),
        }
    }
}

/// Change record as delivered by the feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawChange {
    /// "INSERT", "UPDATE" or "DELETE"
    #[serde(alias = "eventType", alias = "type")]
    pub event_type: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    /// Row before the change (null or `{}` when absent)
    #[serde(default)]
    pub old: Option<JsonValue>,
    /// Row after the change (null or `{}` when absent)
    #[serde(default)]
    pub new: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<String>,
}

impl RawChange {
    pub fn insert(table: &str, new: JsonValue) -> Self {
        Self::build("INSERT", table, None, Some(new))
    }

    pub fn update(table: &str, old: JsonValue, new: JsonValue) -> Self {
        Self::build("UPDATE", table, Some(old), Some(new))
    }

    pub fn delete(table: &str, old: JsonValue) -> Self {
        Self::build("DELETE", table, Some(old), None)
    }

    fn build(event_type: &str, table: &str, old: Option<JsonValue>, new: Option<JsonValue>) -> Self {
        Self {
            event_type: event_type.to_string(),
            schema: "public".to_string(),
            table: table.to_string(),
            old,
            new,
            commit_timestamp: None,
        }
    }

    /// Row after the change, treating `{}` as absent
    pub fn new_record(&self) -> Option<&Map<String, JsonValue>> {
        non_empty_object(self.new.as_ref())
    }

    /// Row before the change, treating `{}` as absent
    pub fn old_record(&self) -> Option<&Map<String, JsonValue>> {
        non_empty_object(self.old.as_ref())
    }

    /// Id of the row this change touches, from `new` or else `old`
    pub fn entity_id(&self) -> Option<EntityId> {
        self.new_record()
            .and_then(|r| r.get("id"))
            .or_else(|| self.old_record().and_then(|r| r.get("id")))
            .and_then(|id| match id {
                JsonValue::String(s) if !s.is_empty() => Some(EntityId::from(s.as_str())),
                JsonValue::Number(n) => Some(EntityId::from(n.to_string())),
                _ => None,
            })
    }
}

fn non_empty_object(value: Option<&JsonValue>) -> Option<&Map<String, JsonValue>> {
    value.and_then(|v| v.as_object()).filter(|m| !m.is_empty())
}

/// A validated entity mutation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity_id: EntityId,
    pub before: Option<Property>,
    pub after: Option<Property>,
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Build an event, enforcing the before/after shape for its kind
    pub fn new(
        kind: ChangeKind,
        entity_id: EntityId,
        before: Option<Property>,
        after: Option<Property>,
        observed_at: DateTime<Utc>,
    ) -> Result<Self> {
        let shape_ok = match kind {
            ChangeKind::Insert => before.is_none() && after.is_some(),
            ChangeKind::Update => before.is_some() && after.is_some(),
            ChangeKind::Delete => after.is_none(),
        };
        if !shape_ok {
            return Err(SyncError::MalformedEvent(format!(
                "{} for {} has an invalid before/after shape",
                kind, entity_id
            )));
        }

        for snapshot in before.iter().chain(after.iter()) {
            if snapshot.id != entity_id {
                return Err(SyncError::MalformedEvent(format!(
                    "{} for {} carries a snapshot of {}",
                    kind, entity_id, snapshot.id
                )));
            }
        }

        Ok(Self {
            kind,
            entity_id,
            before,
            after,
            observed_at,
        })
    }

    pub fn insert(after: Property) -> Self {
        Self {
            kind: ChangeKind::Insert,
            entity_id: after.id.clone(),
            before: None,
            after: Some(after),
            observed_at: Utc::now(),
        }
    }

    /// Update event; fails if the snapshots belong to different ids
    pub fn update(before: Property, after: Property) -> Result<Self> {
        let id = after.id.clone();
        Self::new(ChangeKind::Update, id, Some(before), Some(after), Utc::now())
    }

    pub fn delete(entity_id: impl Into<EntityId>, before: Option<Property>) -> Result<Self> {
        Self::new(ChangeKind::Delete, entity_id.into(), before, None, Utc::now())
    }

    /// Version this event would install (or, for deletes, the deleted version)
    pub fn version(&self) -> Option<Version> {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(|p| p.version)
    }

    /// Validate and convert a feed record.
    ///
    /// An UPDATE whose `old` row is partial (commonly just the primary key)
    /// gets a `before` made of `new` overlaid with whatever `old` carries.
    pub fn from_raw(raw: &RawChange) -> Result<Self> {
        let kind: ChangeKind = raw.event_type.parse()?;
        let observed_at = match raw.commit_timestamp.as_deref() {
            Some(ts) => parse_timestamp(ts)?,
            None => Utc::now(),
        };

        let entity_id = raw.entity_id().ok_or_else(|| {
            SyncError::MalformedEvent(format!("{} on '{}' without a row id", kind, raw.table))
        })?;

        match kind {
            ChangeKind::Insert => {
                let new = raw.new_record().ok_or_else(|| {
                    SyncError::MalformedEvent(format!("INSERT for {} without new row", entity_id))
                })?;
                let after = Property::from_record(&JsonValue::Object(new.clone()))?;
                Self::new(kind, entity_id, None, Some(after), observed_at)
            }
            ChangeKind::Update => {
                let new = raw.new_record().ok_or_else(|| {
                    SyncError::MalformedEvent(format!("UPDATE for {} without new row", entity_id))
                })?;
                let mut before_row = new.clone();
                if let Some(old) = raw.old_record() {
                    for (column, value) in old {
                        before_row.insert(column.clone(), value.clone());
                    }
                }
                let before = Property::from_record(&JsonValue::Object(before_row))?;
                let after = Property::from_record(&JsonValue::Object(new.clone()))?;
                Self::new(kind, entity_id, Some(before), Some(after), observed_at)
            }
            ChangeKind::Delete => {
                // Delete rows are often key-only; a full snapshot is a bonus.
                let before = raw
                    .old_record()
                    .and_then(|old| Property::from_record(&JsonValue::Object(old.clone())).ok());
                Self::new(kind, entity_id, before, None, observed_at)
            }
        }
    }
}
