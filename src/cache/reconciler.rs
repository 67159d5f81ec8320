//! State reconciler
//!
//! Applies change events to the cache. For any sequence of redelivered or
//! reordered events for one id, the cached snapshot ends up being the one
//! with the highest version, independent of delivery order.
//!
//! - Insert/Update replace the entry only when the incoming version is
//!   strictly greater than what is cached (or tombstoned).
//! - Delete removes the entry unconditionally and leaves a tombstone with the
//!   highest version the id had, so an older update arriving late cannot
//!   resurrect it. A fresh, higher version re-creates the entity.
//! - Delete for an id that is not cached is a no-op.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{CacheConfig, PropertyQuery};
use crate::model::{ChangeEvent, ChangeKind, EntityId, Property, Version};

/// A cached snapshot with bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub entity: Property,
    pub version: Version,
    /// When this snapshot was installed
    pub last_applied_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(entity: Property) -> Self {
        Self {
            version: entity.version,
            entity,
            last_applied_at: Utc::now(),
        }
    }
}

/// A change that altered the cache
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub kind: ChangeKind,
    pub entity_id: EntityId,
    /// Snapshot the change replaced: the cached one, else the event's own `before`
    pub previous: Option<Property>,
    /// Snapshot now cached (`None` after a delete)
    pub current: Option<Property>,
}

/// Result of applying one event
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The cache changed; forward downstream
    Applied(AppliedChange),
    /// Version not newer than what is known; discarded
    Stale {
        entity_id: EntityId,
        incoming: Version,
        current: Version,
    },
    /// Delete for an id that is not cached
    UnknownDelete { entity_id: EntityId },
    /// Event without the snapshot its kind requires
    Malformed { entity_id: EntityId },
}

impl ApplyOutcome {
    pub fn is_effective(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn applied(&self) -> Option<&AppliedChange> {
        match self {
            Self::Applied(change) => Some(change),
            _ => None,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcilerStats {
    pub entries: usize,
    pub tombstones: usize,
    pub applied: u64,
    pub stale: u64,
    pub deletes: u64,
    pub unknown_deletes: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<EntityId, CacheEntry>,
    /// id -> (deleted version, tombstone sequence)
    tombstones: HashMap<EntityId, (Version, u64)>,
    tombstone_order: VecDeque<(EntityId, u64)>,
    next_tombstone: u64,
}

impl CacheState {
    /// Highest version known for `id`, live or deleted
    fn known_version(&self, id: &EntityId) -> Option<Version> {
        self.entries
            .get(id)
            .map(|e| e.version)
            .or_else(|| self.tombstones.get(id).map(|(v, _)| *v))
    }

    fn install(&mut self, entity: Property) -> Option<Property> {
        self.tombstones.remove(&entity.id);
        self.entries
            .insert(entity.id.clone(), CacheEntry::new(entity))
            .map(|e| e.entity)
    }

    fn bury(&mut self, id: EntityId, version: Version, max: usize) {
        let seq = self.next_tombstone;
        self.next_tombstone += 1;
        self.tombstones.insert(id.clone(), (version, seq));
        self.tombstone_order.push_back((id, seq));

        while self.tombstones.len() > max {
            let Some((oldest, seq)) = self.tombstone_order.pop_front() else {
                break;
            };
            // Skip order slots superseded by a later burial or a revival
            if self.tombstones.get(&oldest).is_some_and(|(_, s)| *s == seq) {
                self.tombstones.remove(&oldest);
            }
        }
        if self.tombstone_order.len() > max.saturating_mul(2) {
            let live = &self.tombstones;
            self.tombstone_order
                .retain(|(id, seq)| live.get(id).is_some_and(|(_, s)| s == seq));
        }
    }
}

/// Authoritative in-process cache of property snapshots
pub struct StateReconciler {
    state: RwLock<CacheState>,
    config: CacheConfig,
    applied: AtomicU64,
    stale: AtomicU64,
    deletes: AtomicU64,
    unknown_deletes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StateReconciler {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            config,
            applied: AtomicU64::new(0),
            stale: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            unknown_deletes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Apply one change event.
    ///
    /// Idempotent: applying the same event again yields `Stale` (or
    /// `UnknownDelete`) and leaves the cache untouched.
    pub async fn apply(&self, event: &ChangeEvent) -> ApplyOutcome {
        let mut state = self.state.write().await;
        let id = event.entity_id.clone();

        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(after) = event.after.as_ref() else {
                    warn!(entity_id = %id, kind = %event.kind, "Change without an after snapshot");
                    return ApplyOutcome::Malformed { entity_id: id };
                };

                if let Some(current) = state.known_version(&id) {
                    if after.version <= current {
                        self.stale.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            entity_id = %id,
                            incoming = %after.version,
                            current = %current,
                            "Discarding stale change"
                        );
                        return ApplyOutcome::Stale {
                            entity_id: id,
                            incoming: after.version,
                            current,
                        };
                    }
                }

                let previous = state.install(after.clone()).or_else(|| event.before.clone());
                self.applied.fetch_add(1, Ordering::Relaxed);
                debug!(entity_id = %id, version = %after.version, kind = %event.kind, "Change applied");

                ApplyOutcome::Applied(AppliedChange {
                    kind: event.kind,
                    entity_id: id,
                    previous,
                    current: Some(after.clone()),
                })
            }
            ChangeKind::Delete => {
                let Some(removed) = state.entries.remove(&id) else {
                    self.unknown_deletes.fetch_add(1, Ordering::Relaxed);
                    debug!(entity_id = %id, "Delete for unknown id ignored");
                    return ApplyOutcome::UnknownDelete { entity_id: id };
                };

                let deleted_version = event
                    .before
                    .as_ref()
                    .map(|b| b.version.max(removed.version))
                    .unwrap_or(removed.version);
                state.bury(id.clone(), deleted_version, self.config.max_tombstones);

                self.deletes.fetch_add(1, Ordering::Relaxed);
                debug!(entity_id = %id, version = %deleted_version, "Entity deleted");

                ApplyOutcome::Applied(AppliedChange {
                    kind: ChangeKind::Delete,
                    entity_id: id,
                    previous: Some(removed.entity),
                    current: None,
                })
            }
        }
    }

    /// Merge a full re-fetch under the same last-writer-wins rule.
    ///
    /// The snapshot is authoritative for everything it could have seen: a
    /// cached id missing from it is deleted (and tombstoned) unless its
    /// cached version is newer than every version in the snapshot, meaning a
    /// live change landed after the fetch. Produces no downstream changes.
    /// Returns how many snapshots were installed.
    pub async fn hydrate(&self, snapshot: Vec<Property>) -> usize {
        let mut state = self.state.write().await;
        let total = snapshot.len();
        let watermark = snapshot.iter().map(|p| p.version).max();
        let present: HashSet<EntityId> = snapshot.iter().map(|p| p.id.clone()).collect();
        let mut installed = 0;

        for property in snapshot {
            let newer = state
                .known_version(&property.id)
                .map_or(true, |current| property.version > current);
            if newer {
                state.install(property);
                installed += 1;
            }
        }

        let vanished: Vec<(EntityId, Version)> = state
            .entries
            .iter()
            .filter(|(id, entry)| {
                !present.contains(*id) && watermark.map_or(true, |w| entry.version <= w)
            })
            .map(|(id, entry)| (id.clone(), entry.version))
            .collect();
        let removed = vanished.len();
        for (id, version) in vanished {
            state.entries.remove(&id);
            state.bury(id, version, self.config.max_tombstones);
        }
        self.deletes.fetch_add(removed as u64, Ordering::Relaxed);

        info!(installed, removed, total, "Cache hydrated from snapshot");
        installed
    }

    /// Copy of the cached snapshot for `id`
    pub async fn get(&self, id: &EntityId) -> Option<Property> {
        self.entry(id).await.map(|entry| entry.entity)
    }

    /// Copy of the cache entry for `id`, with bookkeeping
    pub async fn entry(&self, id: &EntityId) -> Option<CacheEntry> {
        let state = self.state.read().await;
        match state.entries.get(id) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Point-in-time snapshot of every entity matching `predicate`
    pub async fn list<F>(&self, predicate: F) -> Vec<Property>
    where
        F: Fn(&Property) -> bool,
    {
        let mut results: Vec<Property> = {
            let state = self.state.read().await;
            state
                .entries
                .values()
                .map(|entry| &entry.entity)
                .filter(|p| predicate(p))
                .cloned()
                .collect()
        };

        results.sort_by(newest_first);
        results
    }

    /// Snapshot filtered by a [`PropertyQuery`]
    pub async fn query(&self, query: &PropertyQuery) -> Vec<Property> {
        let mut results = self.list(|p| query.matches(p)).await;
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        results
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> ReconcilerStats {
        let state = self.state.read().await;
        ReconcilerStats {
            entries: state.entries.len(),
            tombstones: state.tombstones.len(),
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            unknown_deletes: self.unknown_deletes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for StateReconciler {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Newest `created_at` first (undated last), ties by id
fn newest_first(a: &Property, b: &Property) -> CmpOrdering {
    match (a.created_at, b.created_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}
