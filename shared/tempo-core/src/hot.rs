//! Bounded TTL hot cache shared by the client and server hot tiers.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::clock::Clock;
use crate::domain::{EntityType, EntryKey, TimeRangeQuery, TimelineEntry};

#[derive(Clone)]
struct CachedEntry {
    entry: TimelineEntry,
    inserted_at: i64,
}

/// Entry-bounded in-memory cache with per-entry TTL and lazy expiry.
///
/// Oldest inserts are evicted once the bound is reached. Expired entries are
/// filtered on every read even before physical eviction.
pub struct HotCache {
    max_entries: usize,
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
    entries: DashMap<EntryKey, CachedEntry>,
    order: Mutex<VecDeque<EntryKey>>,
}

impl HotCache {
    pub fn new(max_entries: usize, ttl_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_entries,
            ttl_ms,
            clock,
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    fn is_live(&self, cached: &CachedEntry, now_ms: i64) -> bool {
        now_ms - cached.inserted_at < self.ttl_ms && !cached.entry.is_expired(now_ms)
    }

    /// Idempotent upsert; an existing key is overwritten in place.
    pub fn put(&self, entry: TimelineEntry) {
        let now_ms = self.clock.now_ms();
        let key = entry.key();
        let fresh = self
            .entries
            .insert(
                key.clone(),
                CachedEntry {
                    entry,
                    inserted_at: now_ms,
                },
            )
            .is_none();

        if fresh {
            let mut order = self.order.lock();
            order.push_back(key);
            while order.len() > self.max_entries {
                if let Some(oldest) = order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    pub fn put_batch(&self, entries: Vec<TimelineEntry>) {
        for entry in entries {
            self.put(entry);
        }
    }

    pub fn get(&self, key: &EntryKey) -> Option<TimelineEntry> {
        let now_ms = self.clock.now_ms();
        let cached = self.entries.get(key)?;
        if self.is_live(&cached, now_ms) {
            Some(cached.entry.clone())
        } else {
            None
        }
    }

    /// Linear filter over the bounded entry set, timestamp-ascending.
    pub fn query(&self, query: &TimeRangeQuery) -> Vec<TimelineEntry> {
        let now_ms = self.clock.now_ms();
        let mut results: Vec<TimelineEntry> = self
            .entries
            .iter()
            .filter(|item| self.is_live(item.value(), now_ms))
            .filter(|item| query.matches(&item.value().entry))
            .map(|item| item.value().entry.clone())
            .collect();

        results.sort_by_key(|e| (e.timestamp, e.entity_id.clone()));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        results
    }

    pub fn invalidate(&self, entity_type: &EntityType, entity_id: Option<&str>) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let matches = key.entity_type == *entity_type
                && entity_id.map_or(true, |id| key.entity_id == id);
            if matches {
                removed += 1;
            }
            !matches
        });
        removed
    }

    /// Physically drop entries past their TTL or domain expiry.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, cached| {
            now_ms - cached.inserted_at < self.ttl_ms && !cached.entry.is_expired(now_ms)
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            let mut order = self.order.lock();
            order.retain(|key| self.entries.contains_key(key));
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.order.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn cache(max: usize, ttl_ms: i64) -> (HotCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (HotCache::new(max, ttl_ms, clock.clone()), clock)
    }

    fn entry(id: &str, ts: i64) -> TimelineEntry {
        TimelineEntry::new(EntityType::Aircraft, id, ts, json!({"lat": 1.0}))
    }

    #[test]
    fn ttl_expiry_hides_entries_before_eviction() {
        let (cache, clock) = cache(100, 5_000);
        cache.put(entry("N1", 10));
        assert!(cache.get(&entry("N1", 10).key()).is_some());

        clock.advance(5_000);
        // Still physically present, but never returned.
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&entry("N1", 10).key()).is_none());
        assert!(cache
            .query(&TimeRangeQuery::range(EntityType::Aircraft, 0, 100))
            .is_empty());

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn eviction_drops_oldest_insert_first() {
        let (cache, _clock) = cache(2, 60_000);
        cache.put(entry("N1", 10));
        cache.put(entry("N2", 20));
        cache.put(entry("N3", 30));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&entry("N1", 10).key()).is_none());
        assert!(cache.get(&entry("N3", 30).key()).is_some());
    }

    #[test]
    fn upsert_same_key_is_idempotent() {
        let (cache, _clock) = cache(10, 60_000);
        cache.put(entry("N1", 10));
        cache.put(entry("N1", 10));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn query_filters_by_entity_and_range() {
        let (cache, _clock) = cache(100, 60_000);
        cache.put_batch(vec![entry("N1", 10), entry("N1", 50), entry("N2", 20)]);

        let q = TimeRangeQuery::range(EntityType::Aircraft, 0, 30).for_entity("N1");
        let results = cache.query(&q);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].timestamp, 10);
    }

    #[test]
    fn invalidate_scopes_to_entity() {
        let (cache, _clock) = cache(100, 60_000);
        cache.put_batch(vec![entry("N1", 10), entry("N2", 20)]);
        assert_eq!(cache.invalidate(&EntityType::Aircraft, Some("N1")), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate(&EntityType::Aircraft, None), 1);
        assert!(cache.is_empty());
    }
}
