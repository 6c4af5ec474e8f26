//! Distributed cache tier - shared, time-indexed, medium-TTL
//!
//! Maintains a secondary time-sorted index per (entity_type, entity_id) so
//! range scans never walk the full key space. Writes are last-write-wins
//! upserts; concurrent writers to the same composite key may race, which is
//! acceptable because entries are immutable state snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use tempo_core::{Clock, EntityType, EntryKey, Result, TempoError, TimeRangeQuery, TimelineEntry};

#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn put_batch(&self, entries: &[TimelineEntry]) -> Result<()>;

    async fn query_range(&self, query: &TimeRangeQuery) -> Result<Vec<TimelineEntry>>;

    /// Remove matching entries; `before` bounds the deletion to timestamps
    /// strictly below it.
    async fn invalidate(
        &self,
        entity_type: &EntityType,
        entity_id: Option<&str>,
        before: Option<i64>,
    ) -> Result<u64>;

    async fn is_healthy(&self) -> bool;
}

struct StoredEntry {
    entry: TimelineEntry,
    stored_at: i64,
}

#[derive(Default)]
struct SharedState {
    entries: HashMap<EntryKey, StoredEntry>,
    /// (entity_type, entity_id) -> timestamp -> key
    index: HashMap<(EntityType, String), BTreeMap<i64, EntryKey>>,
}

/// Process-shared distributed tier implementation.
///
/// Backs the trait for single-host deployments and tests; multi-host
/// deployments swap in an implementation over an external store.
pub struct SharedCache {
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
    state: RwLock<SharedState>,
    unreachable: AtomicBool,
}

impl SharedCache {
    pub fn new(ttl_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl_ms,
            clock,
            state: RwLock::new(SharedState::default()),
            unreachable: AtomicBool::new(false),
        }
    }

    /// Simulate (or administratively force) an outage of this tier.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(TempoError::TierUnavailable {
                tier: "distributed",
                reason: "cache unreachable".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn is_live(&self, stored: &StoredEntry, now_ms: i64) -> bool {
        now_ms - stored.stored_at < self.ttl_ms && !stored.entry.is_expired(now_ms)
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Drop entries past TTL or domain expiry, pruning the index with them.
    pub async fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let mut state = self.state.write().await;

        let dead: Vec<EntryKey> = state
            .entries
            .iter()
            .filter(|(_, stored)| {
                now_ms - stored.stored_at >= self.ttl_ms || stored.entry.is_expired(now_ms)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &dead {
            state.entries.remove(key);
            let index_key = (key.entity_type.clone(), key.entity_id.clone());
            if let Some(per_entity) = state.index.get_mut(&index_key) {
                per_entity.remove(&key.timestamp);
                if per_entity.is_empty() {
                    state.index.remove(&index_key);
                }
            }
        }
        dead.len()
    }
}

#[async_trait]
impl DistributedCache for SharedCache {
    async fn put_batch(&self, entries: &[TimelineEntry]) -> Result<()> {
        self.check_reachable()?;
        let now_ms = self.clock.now_ms();
        let mut state = self.state.write().await;

        for entry in entries {
            let key = entry.key();
            state
                .index
                .entry((key.entity_type.clone(), key.entity_id.clone()))
                .or_default()
                .insert(key.timestamp, key.clone());
            state.entries.insert(
                key,
                StoredEntry {
                    entry: entry.clone(),
                    stored_at: now_ms,
                },
            );
        }
        Ok(())
    }

    async fn query_range(&self, query: &TimeRangeQuery) -> Result<Vec<TimelineEntry>> {
        self.check_reachable()?;
        let now_ms = self.clock.now_ms();
        let state = self.state.read().await;

        let mut results: Vec<TimelineEntry> = Vec::new();
        let limit = query.limit.unwrap_or(usize::MAX);

        let index_keys: Vec<&(EntityType, String)> = state
            .index
            .keys()
            .filter(|(entity_type, entity_id)| {
                *entity_type == query.entity_type
                    && query
                        .entity_id
                        .as_deref()
                        .map_or(true, |id| entity_id == id)
            })
            .collect();

        for index_key in index_keys {
            let per_entity = &state.index[index_key];
            for (_, key) in per_entity.range(query.start_time..=query.end_time) {
                if let Some(stored) = state.entries.get(key) {
                    if self.is_live(stored, now_ms) {
                        results.push(stored.entry.clone());
                    }
                }
            }
        }

        results.sort_by_key(|e| (e.timestamp, e.entity_id.clone()));
        results.truncate(limit);
        Ok(results)
    }

    async fn invalidate(
        &self,
        entity_type: &EntityType,
        entity_id: Option<&str>,
        before: Option<i64>,
    ) -> Result<u64> {
        self.check_reachable()?;
        let mut state = self.state.write().await;
        let mut removed = 0u64;

        let matching: Vec<EntryKey> = state
            .entries
            .keys()
            .filter(|key| {
                key.entity_type == *entity_type
                    && entity_id.map_or(true, |id| key.entity_id == id)
                    && before.map_or(true, |b| key.timestamp < b)
            })
            .cloned()
            .collect();

        for key in matching {
            state.entries.remove(&key);
            let index_key = (key.entity_type.clone(), key.entity_id.clone());
            if let Some(per_entity) = state.index.get_mut(&index_key) {
                per_entity.remove(&key.timestamp);
                if per_entity.is_empty() {
                    state.index.remove(&index_key);
                }
            }
            removed += 1;
        }
        Ok(removed)
    }

    async fn is_healthy(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }
}
