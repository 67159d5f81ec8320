//! Property listing snapshots
//!
//! A [`Property`] is one immutable snapshot of a listing row. Snapshots are
//! ordered by [`Version`]; the cache keeps only the highest one per id.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::types::{Result, SyncError};

/// Opaque listing identifier
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Monotonic version stamp for a snapshot.
///
/// Either an upstream sequence number or `updated_at` in microseconds since
/// the Unix epoch when the row carries no sequence column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// Derive a version from a wall-clock timestamp
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.timestamp_micros().max(0) as u64)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A property listing snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: EntityId,
    pub title: String,
    pub price: f64,
    pub active: bool,
    pub featured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub version: Version,
    /// Columns the sync core does not interpret (location, bedrooms, images, ...)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, JsonValue>,
}

impl Property {
    /// Minimal snapshot, mostly useful for seeding and tests
    pub fn new(id: impl Into<EntityId>, title: impl Into<String>, price: f64, version: u64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            price,
            active: true,
            featured: false,
            created_at: None,
            updated_at: None,
            version: Version(version),
            attributes: Map::new(),
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_featured(mut self, featured: bool) -> Self {
        self.featured = featured;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Parse a row as emitted by the change feed.
    ///
    /// Accepts both `active`/`featured` and `is_active`/`is_featured` column
    /// names, numeric or string ids and prices.
    pub fn from_record(record: &JsonValue) -> Result<Self> {
        let record: PropertyRecord = serde_json::from_value(record.clone())?;
        record.try_into()
    }
}

/// Row shape on the wire
#[derive(Debug, Deserialize)]
struct PropertyRecord {
    #[serde(deserialize_with = "deserialize_id")]
    id: EntityId,
    #[serde(default)]
    title: String,
    #[serde(default, deserialize_with = "deserialize_price")]
    price: f64,
    #[serde(default, alias = "is_active")]
    active: bool,
    #[serde(default, alias = "is_featured")]
    featured: bool,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    version: Option<u64>,
    #[serde(flatten)]
    attributes: Map<String, JsonValue>,
}

impl TryFrom<PropertyRecord> for Property {
    type Error = SyncError;

    fn try_from(record: PropertyRecord) -> Result<Self> {
        let created_at = record.created_at.as_deref().map(parse_timestamp).transpose()?;
        let updated_at = record.updated_at.as_deref().map(parse_timestamp).transpose()?;

        let version = match (record.version, updated_at) {
            (Some(seq), _) => Version(seq),
            (None, Some(ts)) => Version::from_timestamp(ts),
            (None, None) => {
                return Err(SyncError::MalformedEvent(format!(
                    "record {} has neither a version nor updated_at",
                    record.id
                )))
            }
        };

        Ok(Self {
            id: record.id,
            title: record.title,
            price: record.price,
            active: record.active,
            featured: record.featured,
            created_at,
            updated_at,
            version,
            attributes: record.attributes,
        })
    }
}

/// Parse RFC 3339 or Postgres text timestamps (`2024-03-01 10:00:00.5+00`)
pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SyncError::MalformedEvent(format!("invalid timestamp '{}': {}", raw, e)))
}

fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<EntityId, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) if !s.is_empty() => Ok(EntityId(s)),
        JsonValue::Number(n) => Ok(EntityId(n.to_string())),
        other => Err(serde::de::Error::custom(format!("invalid id: {}", other))),
    }
}

fn deserialize_price<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("price out of range")),
        JsonValue::String(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid price: {}", s))),
        JsonValue::Null => Ok(0.0),
        other => Err(serde::de::Error::custom(format!("invalid price: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_with_sequence_version() {
        let record = json!({
            "id": "prop-1",
            "title": "Sea view flat",
            "price": 250000,
            "is_active": true,
            "is_featured": false,
            "version": 7,
            "bedrooms": 2,
            "location": "Lisbon"
        });

        let property = Property::from_record(&record).unwrap();
        assert_eq!(property.id, EntityId::from("prop-1"));
        assert_eq!(property.version, Version(7));
        assert!(property.active);
        assert_eq!(property.price, 250000.0);
        assert_eq!(property.attributes.get("bedrooms"), Some(&json!(2)));
        assert_eq!(property.attributes.get("location"), Some(&json!("Lisbon")));
    }

    #[test]
    fn test_version_from_updated_at() {
        let record = json!({
            "id": 42,
            "title": "Cottage",
            "price": "99000.50",
            "active": false,
            "updated_at": "2024-03-01T10:00:00Z"
        });

        let property = Property::from_record(&record).unwrap();
        assert_eq!(property.id.as_str(), "42");
        assert_eq!(property.price, 99000.5);
        let expected = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(property.version, Version::from_timestamp(expected));
    }

    #[test]
    fn test_postgres_timestamp_format() {
        let ts = parse_timestamp("2024-03-01 10:00:00.250+00").unwrap();
        assert_eq!(ts.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_record_without_version_is_malformed() {
        let record = json!({ "id": "x", "title": "No stamp", "price": 1 });
        let err = Property::from_record(&record).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent(_)));
    }

    #[test]
    fn test_record_without_id_is_malformed() {
        let record = json!({ "title": "Orphan", "version": 1 });
        assert!(Property::from_record(&record).is_err());
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version(3) < Version(7));
        assert_eq!(Version(5).to_string(), "v5");
    }
}
