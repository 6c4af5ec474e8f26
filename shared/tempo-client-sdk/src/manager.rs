//! Client cache manager - hot, persistent, then remote
//!
//! The local tiers answer only when the coverage map proves the requested
//! range was fetched before; otherwise the remote service is asked and the
//! answer is written back down the stack. Identical concurrent queries are
//! coalesced into one remote call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use tempo_core::{
    merge_entries, Clock, EntityType, EntryKey, HotCache, LiveUpdateMessage, Result, TempoError,
    Tier, TimeRangeQuery, TimelineConfig, TimelineEntry,
};

use crate::coverage::CoverageMap;
use crate::persistent::{PersistentCache, PersistentStats};
use crate::remote::RemoteApi;

type Scope = (EntityType, Option<String>);

#[derive(Debug, Clone, Serialize)]
pub struct ClientQueryResult {
    pub entries: Vec<TimelineEntry>,
    pub answering_tier: Tier,
    pub partial: bool,
    /// The remote tier failed and this answer came from local data alone.
    pub remote_unavailable: bool,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub hot_hits: u64,
    pub hot_misses: u64,
    pub persistent_hits: u64,
    pub remote_fetches: u64,
    pub remote_failures: u64,
    pub hot_entries: usize,
    pub persistent: Option<PersistentStats>,
}

pub struct CacheManager {
    config: TimelineConfig,
    clock: Arc<dyn Clock>,
    hot: HotCache,
    persistent: Option<Arc<PersistentCache>>,
    remote: Arc<dyn RemoteApi>,

    /// Which ranges each scope has locally, per (entity_type, entity_id).
    coverage: Mutex<HashMap<Scope, CoverageMap>>,
    /// Normalized query keys answered recently; the hot tier is complete for
    /// these until the hot TTL lapses.
    answered: DashMap<String, i64>,
    /// One async mutex per in-flight normalized query key.
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,

    hot_hits: AtomicU64,
    hot_misses: AtomicU64,
    persistent_hits: AtomicU64,
    remote_fetches: AtomicU64,
    remote_failures: AtomicU64,
}

impl CacheManager {
    pub fn new(
        config: TimelineConfig,
        clock: Arc<dyn Clock>,
        remote: Arc<dyn RemoteApi>,
        persistent: Option<Arc<PersistentCache>>,
    ) -> Self {
        let hot = HotCache::new(
            config.hot_cache_max_entries,
            config.hot_cache_ttl_ms(),
            clock.clone(),
        );
        Self {
            config,
            clock,
            hot,
            persistent,
            remote,
            coverage: Mutex::new(HashMap::new()),
            answered: DashMap::new(),
            inflight: DashMap::new(),
            hot_hits: AtomicU64::new(0),
            hot_misses: AtomicU64::new(0),
            persistent_hits: AtomicU64::new(0),
            remote_fetches: AtomicU64::new(0),
            remote_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TimelineConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn scope(query: &TimeRangeQuery) -> Scope {
        (query.entity_type.clone(), query.entity_id.clone())
    }

    fn memo_fresh(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let fresh = self
            .answered
            .get(key)
            .map(|at| now - *at < self.config.hot_cache_ttl_ms())
            .unwrap_or(false);
        if !fresh {
            self.answered.remove(key);
        }
        fresh
    }

    /// A range is locally answerable when its own scope, or the type-wide
    /// scope, has fetched it before.
    fn covered(&self, query: &TimeRangeQuery) -> bool {
        let coverage = self.coverage.lock();
        let in_scope = |scope: &Scope| {
            coverage
                .get(scope)
                .map(|m| m.covers(query.start_time, query.end_time + 1))
                .unwrap_or(false)
        };
        in_scope(&Self::scope(query)) || in_scope(&(query.entity_type.clone(), None))
    }

    fn mark_covered(&self, query: &TimeRangeQuery) {
        let mut coverage = self.coverage.lock();
        coverage
            .entry(Self::scope(query))
            .or_default()
            .insert(query.start_time, query.end_time + 1);
    }

    /// Uncovered sub-ranges of `[start, end)` for a scope, used by the
    /// loader to fill only what is missing.
    pub fn missing_ranges(
        &self,
        entity_type: &EntityType,
        entity_id: Option<&str>,
        start: i64,
        end: i64,
    ) -> Vec<(i64, i64)> {
        let coverage = self.coverage.lock();
        let scope = (entity_type.clone(), entity_id.map(str::to_string));
        match coverage.get(&scope) {
            Some(map) => map.gaps(start, end),
            None => {
                // Fall back to type-wide coverage before declaring the whole
                // range missing.
                let type_scope = (entity_type.clone(), None);
                match coverage.get(&type_scope) {
                    Some(map) if entity_id.is_some() => map.gaps(start, end),
                    _ => vec![(start, end)],
                }
            }
        }
    }

    async fn local_query(&self, query: &TimeRangeQuery) -> Result<(Vec<TimelineEntry>, Tier)> {
        if let Some(persistent) = &self.persistent {
            let entries = persistent.query_range(query).await?;
            if !entries.is_empty() {
                return Ok((entries, Tier::Persistent));
            }
        }
        Ok((self.hot.query(query), Tier::ClientHot))
    }

    pub async fn query_range(&self, query: &TimeRangeQuery) -> Result<ClientQueryResult> {
        query.validate()?;
        let started = Instant::now();
        let key = query.normalized_key();

        if self.memo_fresh(&key) {
            let entries = self.hot.query(query);
            if !entries.is_empty() {
                self.hot_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(ClientQueryResult {
                    entries,
                    answering_tier: Tier::ClientHot,
                    partial: false,
                    remote_unavailable: false,
                    latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                });
            }
            self.answered.remove(&key);
        }
        self.hot_misses.fetch_add(1, Ordering::Relaxed);

        // Coalesce identical concurrent queries onto one fetch.
        let gate = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = {
            let _guard = gate.lock().await;
            self.query_range_gated(query, &key, started).await
        };
        // Last holder out drops the gate entry so the map stays bounded;
        // waiters already hold their own clone.
        drop(gate);
        self.inflight
            .remove_if(&key, |_, gate| Arc::strong_count(gate) == 1);
        result
    }

    async fn query_range_gated(
        &self,
        query: &TimeRangeQuery,
        key: &str,
        started: Instant,
    ) -> Result<ClientQueryResult> {
        // Double check: whoever held the gate first may have answered this.
        if self.memo_fresh(key) {
            let entries = self.hot.query(query);
            if !entries.is_empty() {
                self.hot_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(ClientQueryResult {
                    entries,
                    answering_tier: Tier::ClientHot,
                    partial: false,
                    remote_unavailable: false,
                    latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                });
            }
        }

        // Local tiers answer a covered range only while they still hold the
        // data; TTL expiry empties them out from under the coverage map, and
        // an empty local answer must not masquerade as "genuinely empty", so
        // it falls through to the remote instead.
        if self.covered(query) {
            match self.local_query(query).await {
                Ok((entries, tier)) if !entries.is_empty() => {
                    self.persistent_hits.fetch_add(1, Ordering::Relaxed);
                    self.hot.put_batch(entries.clone());
                    self.answered.insert(key.to_string(), self.clock.now_ms());
                    return Ok(ClientQueryResult {
                        entries,
                        answering_tier: tier,
                        partial: false,
                        remote_unavailable: false,
                        latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                    });
                }
                Ok(_) => {
                    debug!("Covered range expired out of the local tiers; refetching");
                }
                Err(e) => {
                    warn!(error = %e, "Persistent tier failed; treating as miss");
                }
            }
        }

        // Remote tier.
        self.remote_fetches.fetch_add(1, Ordering::Relaxed);
        match self.remote.query_range(query).await {
            Ok(result) => {
                if !result.entries.is_empty() {
                    self.hot.put_batch(result.entries.clone());
                    if let Some(persistent) = &self.persistent {
                        if let Err(e) = persistent.put_batch(&result.entries).await {
                            warn!(error = %e, "Persistent write-back failed");
                        }
                    }
                }
                // A partial answer must not be recorded as complete coverage.
                if !result.partial {
                    self.mark_covered(query);
                    self.answered.insert(key.to_string(), self.clock.now_ms());
                }
                debug!(
                    entity_type = %query.entity_type,
                    entries = result.entries.len(),
                    server_tier = %result.answering_tier,
                    "Remote range query answered"
                );
                Ok(ClientQueryResult {
                    entries: result.entries,
                    answering_tier: Tier::Remote,
                    partial: result.partial,
                    remote_unavailable: false,
                    latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                })
            }
            Err(e) => {
                self.remote_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Remote tier unavailable; serving local data");

                // Best effort from whatever the local tiers hold.
                let mut batches = vec![self.hot.query(query)];
                if let Some(persistent) = &self.persistent {
                    if let Ok(entries) = persistent.query_range(query).await {
                        batches.push(entries);
                    }
                }
                let merged = merge_entries(batches, query.limit);
                if merged.is_empty() {
                    return Err(TempoError::DataUnavailable(e.to_string()));
                }
                Ok(ClientQueryResult {
                    entries: merged,
                    answering_tier: Tier::ClientHot,
                    partial: true,
                    remote_unavailable: true,
                    latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                })
            }
        }
    }

    /// Nearest at-or-before lookup; answered locally when the surrounding
    /// chunk is covered, otherwise delegated to the service.
    pub async fn entry_at(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
        timestamp: i64,
    ) -> Result<Option<TimelineEntry>> {
        // An exact-timestamp hot hit is the at-or-before answer by
        // definition, coverage or not.
        let exact = EntryKey {
            entity_type: entity_type.clone(),
            entity_id: entity_id.to_string(),
            timestamp,
        };
        if let Some(entry) = self.hot.get(&exact) {
            return Ok(Some(entry));
        }

        let window = TimeRangeQuery::range(
            entity_type.clone(),
            timestamp.saturating_sub(self.config.chunk_size_ms),
            timestamp,
        )
        .for_entity(entity_id);

        if self.covered(&window) {
            let (entries, _) = self.local_query(&window).await?;
            if let Some(entry) = entries.into_iter().last() {
                return Ok(Some(entry));
            }
        }
        self.remote.entry_at(entity_type, entity_id, timestamp).await
    }

    /// Fold a pushed live update into the local tiers.
    pub async fn apply_live_update(&self, msg: LiveUpdateMessage) -> Result<()> {
        let entry = msg.into_entry();
        let scope = (entry.entity_type.clone(), Some(entry.entity_id.clone()));

        self.hot.put(entry.clone());
        if let Some(persistent) = &self.persistent {
            persistent.put_batch(std::slice::from_ref(&entry)).await?;
        }

        let mut coverage = self.coverage.lock();
        coverage
            .entry(scope)
            .or_default()
            .insert(entry.timestamp, entry.timestamp + 1);
        Ok(())
    }

    /// The live feed dropped updates; local coverage can no longer be
    /// trusted, so every future query goes back to the service once.
    pub fn handle_resync_required(&self, dropped: u64) {
        warn!(dropped, "Live feed lagged; discarding local coverage");
        self.coverage.lock().clear();
        self.answered.clear();
    }

    pub async fn invalidate(
        &self,
        entity_type: &EntityType,
        entity_id: Option<&str>,
    ) -> Result<u64> {
        let hot_removed = self.hot.invalidate(entity_type, entity_id) as u64;
        let mut removed = hot_removed;
        if let Some(persistent) = &self.persistent {
            removed += persistent.invalidate(entity_type, entity_id).await?;
        }

        let mut coverage = self.coverage.lock();
        coverage.retain(|(scope_type, scope_id), _| {
            !(scope_type == entity_type
                && entity_id.map_or(true, |id| scope_id.as_deref() == Some(id) || scope_id.is_none()))
        });
        drop(coverage);

        let prefix = format!("{}:", entity_type);
        let now = self.clock.now_ms();
        let ttl = self.config.hot_cache_ttl_ms();
        self.answered
            .retain(|key, at| !key.starts_with(&prefix) && now - *at < ttl);
        Ok(removed)
    }

    /// Drop expired hot entries and the memo keys that vouched for them.
    /// Long-lived hosts call this periodically; scrubbing produces many
    /// one-shot query keys that would otherwise accumulate.
    pub fn purge_expired(&self) -> usize {
        let removed = self.hot.purge_expired();
        let now = self.clock.now_ms();
        let ttl = self.config.hot_cache_ttl_ms();
        self.answered.retain(|_, at| now - *at < ttl);
        removed
    }

    pub async fn stats(&self) -> ClientStats {
        let persistent = match &self.persistent {
            Some(p) => p.stats().await.ok(),
            None => None,
        };
        ClientStats {
            hot_hits: self.hot_hits.load(Ordering::Relaxed),
            hot_misses: self.hot_misses.load(Ordering::Relaxed),
            persistent_hits: self.persistent_hits.load(Ordering::Relaxed),
            remote_fetches: self.remote_fetches.load(Ordering::Relaxed),
            remote_failures: self.remote_failures.load(Ordering::Relaxed),
            hot_entries: self.hot.len(),
            persistent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tempo_core::{ManualClock, TierResult};

    const START: i64 = 1_770_388_200_000;

    struct MockRemote {
        entries: parking_lot::Mutex<Vec<TimelineEntry>>,
        calls: AtomicU64,
        unreachable: std::sync::atomic::AtomicBool,
        delay: Duration,
    }

    impl MockRemote {
        fn new(entries: Vec<TimelineEntry>) -> Self {
            Self {
                entries: parking_lot::Mutex::new(entries),
                calls: AtomicU64::new(0),
                unreachable: std::sync::atomic::AtomicBool::new(false),
                delay: Duration::from_millis(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteApi for MockRemote {
        async fn query_range(&self, query: &TimeRangeQuery) -> Result<TierResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay > Duration::ZERO {
                tokio::time::sleep(self.delay).await;
            }
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(TempoError::Network("connection refused".to_string()));
            }
            let entries: Vec<TimelineEntry> = self
                .entries
                .lock()
                .iter()
                .filter(|e| query.matches(e))
                .cloned()
                .collect();
            Ok(TierResult {
                entries,
                answering_tier: Tier::Hot,
                partial: false,
                latency_ms: 1.0,
            })
        }

        async fn entry_at(
            &self,
            entity_type: &EntityType,
            entity_id: &str,
            timestamp: i64,
        ) -> Result<Option<TimelineEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .entries
                .lock()
                .iter()
                .filter(|e| {
                    e.entity_type == *entity_type
                        && e.entity_id == entity_id
                        && e.timestamp <= timestamp
                })
                .max_by_key(|e| e.timestamp)
                .cloned())
        }
    }

    fn entry(id: &str, ts: i64) -> TimelineEntry {
        TimelineEntry::new(EntityType::Aircraft, id, ts, json!({"alt": 30000}))
    }

    fn manager(remote: Arc<MockRemote>) -> CacheManager {
        let clock = Arc::new(ManualClock::new(START));
        CacheManager::new(TimelineConfig::default(), clock, remote, None)
    }

    #[tokio::test]
    async fn remote_answer_promotes_to_hot() {
        let remote = Arc::new(MockRemote::new(vec![
            entry("N1", START - 100),
            entry("N1", START - 50),
        ]));
        let mgr = manager(remote.clone());

        let q = TimeRangeQuery::range(EntityType::Aircraft, START - 200, START).for_entity("N1");
        let first = mgr.query_range(&q).await.unwrap();
        assert_eq!(first.answering_tier, Tier::Remote);
        assert_eq!(first.entries.len(), 2);

        let second = mgr.query_range(&q).await.unwrap();
        assert_eq!(second.answering_tier, Tier::ClientHot);
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_queries_coalesce() {
        let remote = Arc::new(
            MockRemote::new(vec![entry("N1", START - 10)])
                .with_delay(Duration::from_millis(20)),
        );
        let mgr = Arc::new(manager(remote.clone()));

        let q = TimeRangeQuery::range(EntityType::Aircraft, START - 100, START).for_entity("N1");
        let (a, b) = tokio::join!(mgr.query_range(&q), mgr.query_range(&q));

        assert_eq!(a.unwrap().entries.len(), 1);
        assert_eq!(b.unwrap().entries.len(), 1);
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn expired_local_data_falls_through_to_the_remote() {
        let remote = Arc::new(MockRemote::new(vec![entry("N1", START - 10)]));
        let clock = Arc::new(ManualClock::new(START));
        let mgr = CacheManager::new(TimelineConfig::default(), clock.clone(), remote.clone(), None);

        let q = TimeRangeQuery::range(EntityType::Aircraft, START - 100, START).for_entity("N1");
        assert_eq!(mgr.query_range(&q).await.unwrap().entries.len(), 1);

        // The hot TTL lapses; coverage alone must not vouch for the range,
        // or the repeat would come back "empty but complete".
        clock.advance(10 * 60 * 1000);
        let result = mgr.query_range(&q).await.unwrap();
        assert_eq!(result.answering_tier, Tier::Remote);
        assert_eq!(result.entries.len(), 1);
        assert!(!result.partial);
        assert_eq!(remote.calls(), 2);
    }

    #[tokio::test]
    async fn finished_queries_release_their_coalescing_gates() {
        let remote = Arc::new(
            MockRemote::new(vec![entry("N1", START - 10)]).with_delay(Duration::from_millis(10)),
        );
        let mgr = Arc::new(manager(remote.clone()));

        let q = TimeRangeQuery::range(EntityType::Aircraft, START - 100, START).for_entity("N1");
        let (a, b) = tokio::join!(mgr.query_range(&q), mgr.query_range(&q));
        a.unwrap();
        b.unwrap();
        assert!(mgr.inflight.is_empty());

        // Scrub-style traffic issues a new key per window; none may linger.
        for offset in 1..5 {
            let q =
                TimeRangeQuery::range(EntityType::Aircraft, START - 100 - offset, START - offset)
                    .for_entity("N1");
            mgr.query_range(&q).await.unwrap();
        }
        assert!(mgr.inflight.is_empty());
    }

    #[tokio::test]
    async fn purge_drops_stale_answered_memos() {
        let remote = Arc::new(MockRemote::new(vec![entry("N1", START - 10)]));
        let clock = Arc::new(ManualClock::new(START));
        let mgr = CacheManager::new(TimelineConfig::default(), clock.clone(), remote, None);

        let q = TimeRangeQuery::range(EntityType::Aircraft, START - 100, START).for_entity("N1");
        mgr.query_range(&q).await.unwrap();
        assert_eq!(mgr.answered.len(), 1);

        clock.advance(10 * 60 * 1000);
        mgr.purge_expired();
        assert!(mgr.answered.is_empty());
    }

    #[tokio::test]
    async fn remote_outage_serves_local_data_as_partial() {
        let remote = Arc::new(MockRemote::new(vec![]));
        let mgr = manager(remote.clone());

        mgr.apply_live_update(LiveUpdateMessage {
            entity_type: EntityType::Aircraft,
            entity_id: "N1".to_string(),
            timestamp: START - 5,
            data: json!({"alt": 31000}),
        })
        .await
        .unwrap();
        remote.unreachable.store(true, Ordering::SeqCst);

        let q = TimeRangeQuery::range(EntityType::Aircraft, START - 100, START);
        let result = mgr.query_range(&q).await.unwrap();
        assert!(result.remote_unavailable);
        assert!(result.partial);
        assert_eq!(result.entries.len(), 1);
    }

    #[tokio::test]
    async fn remote_outage_with_no_local_data_fails() {
        let remote = Arc::new(MockRemote::new(vec![]));
        remote.unreachable.store(true, Ordering::SeqCst);
        let mgr = manager(remote.clone());

        let q = TimeRangeQuery::range(EntityType::Aircraft, START - 100, START);
        let err = mgr.query_range(&q).await.unwrap_err();
        assert_eq!(err.error_code(), "DATA_UNAVAILABLE");
    }

    #[tokio::test]
    async fn resync_discards_coverage() {
        let remote = Arc::new(MockRemote::new(vec![entry("N1", START - 10)]));
        let mgr = manager(remote.clone());

        let q = TimeRangeQuery::range(EntityType::Aircraft, START - 100, START).for_entity("N1");
        mgr.query_range(&q).await.unwrap();
        assert!(mgr
            .missing_ranges(&EntityType::Aircraft, Some("N1"), START - 100, START)
            .is_empty());

        mgr.handle_resync_required(7);
        assert_eq!(
            mgr.missing_ranges(&EntityType::Aircraft, Some("N1"), START - 100, START),
            vec![(START - 100, START)]
        );
    }

    #[tokio::test]
    async fn invalidate_clears_local_tiers_and_coverage() {
        let remote = Arc::new(MockRemote::new(vec![entry("N1", START - 10)]));
        let mgr = manager(remote.clone());

        let q = TimeRangeQuery::range(EntityType::Aircraft, START - 100, START).for_entity("N1");
        mgr.query_range(&q).await.unwrap();
        mgr.invalidate(&EntityType::Aircraft, Some("N1")).await.unwrap();

        // Next query must hit the remote again.
        mgr.query_range(&q).await.unwrap();
        assert_eq!(remote.calls(), 2);
    }
}
