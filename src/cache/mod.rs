//! Reconciled listing cache
//!
//! The [`StateReconciler`] is the single owner of cached property snapshots.
//! It applies change events with last-writer-wins-by-version semantics and
//! hands out clones, never references into its state.

pub mod query;
pub mod reconciler;

pub use query::PropertyQuery;
pub use reconciler::{AppliedChange, ApplyOutcome, CacheEntry, ReconcilerStats, StateReconciler};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Deleted ids remembered to reject reordered older updates
    pub max_tombstones: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_tombstones: 10_000,
        }
    }
}

impl CacheConfig {
    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        let max_tombstones = std::env::var("CACHE_MAX_TOMBSTONES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10_000);

        Self { max_tombstones }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.max_tombstones, 10_000);
    }
}
