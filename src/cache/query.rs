//! Filters over cached listings

use serde::{Deserialize, Serialize};

use crate::model::{EntityId, Property};

/// Listing filter.
///
/// Every set field must match. Results come back newest `created_at` first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub featured: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl PropertyQuery {
    /// What the public site may show: active listings only
    pub fn public() -> Self {
        Self {
            active: Some(true),
            ..Default::default()
        }
    }

    /// What the admin panel sees: everything
    pub fn admin() -> Self {
        Self::default()
    }

    pub fn featured(mut self) -> Self {
        self.featured = Some(true);
        self
    }

    pub fn with_ids(mut self, ids: Vec<EntityId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn price_between(mut self, min: f64, max: f64) -> Self {
        self.min_price = Some(min);
        self.max_price = Some(max);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, property: &Property) -> bool {
        if let Some(active) = self.active {
            if property.active != active {
                return false;
            }
        }

        if let Some(featured) = self.featured {
            if property.featured != featured {
                return false;
            }
        }

        if let Some(ref ids) = self.ids {
            if !ids.contains(&property.id) {
                return false;
            }
        }

        if self.min_price.is_some_and(|min| property.price < min) {
            return false;
        }

        if self.max_price.is_some_and(|max| property.price > max) {
            return false;
        }

        true
    }
}
