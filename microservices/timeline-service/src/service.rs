//! Multi-tier cache orchestration
//!
//! Query path: hot -> distributed -> snapshot archive -> system of record.
//! Non-final tiers run under a short timeout and a timeout is a miss, never
//! a failure; only the system of record's failure is terminal. Results from
//! slower tiers are promoted into every faster tier after resolution.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tempo_core::{
    merge_entries, Clock, DataSource, EntityType, HotCache, Result, TempoError, Tier, TierResult,
    TimeRangeQuery, TimelineConfig, TimelineEntry,
};

use crate::cache::DistributedCache;
use crate::config::ServiceConfig;
use crate::fanout::LiveUpdateFanOut;
use crate::record::SystemOfRecord;
use crate::snapshot::{SnapshotStats, SnapshotStore};
use tempo_core::LiveUpdateMessage;

#[derive(Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TierCounters {
    fn snapshot(&self) -> TierCounterSnapshot {
        TierCounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TierCounterSnapshot {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStatsSnapshot {
    pub tiers: HashMap<String, TierCounterSnapshot>,
    pub hot_entries: usize,
    pub distributed_healthy: bool,
    pub distributed_degraded_count: u64,
    pub record_healthy: bool,
    pub snapshot: SnapshotStats,
    pub total_queries: u64,
    pub ingested_entries: u64,
    pub live_subscribers: usize,
    pub overall_cache_hit_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidationSummary {
    pub hot: usize,
    pub distributed: u64,
    pub snapshot: u64,
}

/// Explicitly constructed, explicitly owned cache service with a defined
/// start/stop lifecycle; injected into the API layer rather than accessed
/// as global state.
pub struct TimelineService {
    config: ServiceConfig,
    clock: Arc<dyn Clock>,
    hot: HotCache,
    distributed: Arc<dyn DistributedCache>,
    snapshots: Arc<SnapshotStore>,
    record: Arc<dyn SystemOfRecord>,
    fanout: LiveUpdateFanOut,

    hot_stats: TierCounters,
    distributed_stats: TierCounters,
    snapshot_stats: TierCounters,
    record_stats: TierCounters,
    distributed_degraded: AtomicU64,
    total_queries: AtomicU64,
    ingested: AtomicU64,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TimelineService {
    pub fn new(
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
        distributed: Arc<dyn DistributedCache>,
        record: Arc<dyn SystemOfRecord>,
    ) -> Result<Self> {
        let timeline = &config.timeline;
        let hot = HotCache::new(
            timeline.hot_cache_max_entries,
            timeline.hot_cache_ttl_ms(),
            clock.clone(),
        );
        let snapshots = Arc::new(SnapshotStore::new(
            &config.snapshot_dir,
            timeline.snapshot_bucket_ms(),
            timeline.snapshot_retention_ms(),
            clock.clone(),
        )?);
        let fanout = LiveUpdateFanOut::new(timeline.live_queue_depth);

        Ok(Self {
            config,
            clock,
            hot,
            distributed,
            snapshots,
            record,
            fanout,
            hot_stats: TierCounters::default(),
            distributed_stats: TierCounters::default(),
            snapshot_stats: TierCounters::default(),
            record_stats: TierCounters::default(),
            distributed_degraded: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
            ingested: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn fanout(&self) -> &LiveUpdateFanOut {
        &self.fanout
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    fn timeline(&self) -> &TimelineConfig {
        &self.config.timeline
    }

    /// Run a non-final tier call under the configured timeout; a timeout is
    /// treated exactly like a tier failure, which the caller absorbs as a
    /// miss.
    async fn with_tier_timeout<T, F>(&self, tier: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = Duration::from_millis(self.timeline().tier_timeout_ms);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TempoError::TierUnavailable {
                tier,
                reason: format!("timed out after {:?}", timeout),
            }),
        }
    }

    /// Sealed-bucket reads do file I/O and gzip decompression, so they run
    /// on the blocking pool; the tier timeout stays enforceable and a timed
    /// out read finishes in the background without stalling the runtime.
    async fn snapshot_query(&self, query: &TimeRangeQuery) -> Result<Vec<TimelineEntry>> {
        let snapshots = self.snapshots.clone();
        let query = query.clone();
        tokio::task::spawn_blocking(move || snapshots.query(&query))
            .await
            .map_err(|e| TempoError::Internal(format!("snapshot read task failed: {}", e)))?
    }

    /// A non-empty cached answer ends the search; a query with a limit keeps
    /// deepening until the limit is met.
    fn satisfied(&self, query: &TimeRangeQuery, batches: &[Vec<TimelineEntry>]) -> bool {
        match query.limit {
            Some(limit) => merge_entries(batches.to_vec(), None).len() >= limit,
            None => batches.iter().any(|b| !b.is_empty()),
        }
    }

    /// Tiered range query with promotion. See module docs for the tier
    /// ordering and failure semantics.
    pub async fn query_range(&self, query: &TimeRangeQuery) -> Result<TierResult> {
        query.validate()?;
        let started = Instant::now();
        self.total_queries.fetch_add(1, Ordering::Relaxed);

        let mut batches: Vec<Vec<TimelineEntry>> = Vec::new();
        let mut answering: Option<Tier> = None;
        let mut promote_to_distributed = false;
        let mut consulted_record = false;
        let mut partial = false;

        // 1. Hot tier.
        let hot_entries = self.hot.query(query);
        if hot_entries.is_empty() {
            self.hot_stats.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hot_stats.hits.fetch_add(1, Ordering::Relaxed);
            answering = Some(Tier::Hot);
        }
        batches.push(hot_entries);

        let mut done = self.satisfied(query, &batches);

        // 2. Distributed tier.
        if !done {
            match self
                .with_tier_timeout("distributed", self.distributed.query_range(query))
                .await
            {
                Ok(entries) => {
                    if entries.is_empty() {
                        self.distributed_stats.misses.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.distributed_stats.hits.fetch_add(1, Ordering::Relaxed);
                        answering.get_or_insert(Tier::Distributed);
                    }
                    batches.push(entries);
                    done = self.satisfied(query, &batches);
                }
                Err(e) => {
                    self.distributed_degraded.fetch_add(1, Ordering::Relaxed);
                    self.distributed_stats.misses.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Distributed tier degraded; falling through");
                }
            }
        }

        // 3. Snapshot archive, for ranges not covered above.
        if !done {
            match self.with_tier_timeout("snapshot", self.snapshot_query(query)).await
            {
                Ok(entries) => {
                    if entries.is_empty() {
                        self.snapshot_stats.misses.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.snapshot_stats.hits.fetch_add(1, Ordering::Relaxed);
                        answering.get_or_insert(Tier::Snapshot);
                        promote_to_distributed = true;
                    }
                    batches.push(entries);
                    done = self.satisfied(query, &batches);
                }
                Err(e) => {
                    self.snapshot_stats.misses.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Snapshot tier degraded; falling through");
                }
            }
        }

        // 4. System of record: final fallback, always correct but slow. Its
        // failure is terminal on a full miss, partial otherwise.
        if !done {
            consulted_record = true;
            match self.record.query_range(query).await {
                Ok(entries) => {
                    if entries.is_empty() {
                        self.record_stats.misses.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.record_stats.hits.fetch_add(1, Ordering::Relaxed);
                        answering.get_or_insert(Tier::SystemOfRecord);
                        promote_to_distributed = true;
                    }
                    batches.push(entries);
                }
                Err(e) => {
                    self.record_stats.misses.fetch_add(1, Ordering::Relaxed);
                    let have_anything = batches.iter().any(|b| !b.is_empty());
                    if !have_anything {
                        return Err(TempoError::DataUnavailable(e.to_string()));
                    }
                    partial = true;
                    warn!(error = %e, "System of record unavailable; returning partial result");
                }
            }
        }

        let answering_tier = answering.unwrap_or(if consulted_record {
            Tier::SystemOfRecord
        } else {
            Tier::Hot
        });
        let merged = merge_entries(batches, query.limit);

        // Promotion: copy what slower tiers resolved into every faster tier.
        if !merged.is_empty() && answering_tier != Tier::Hot {
            self.hot.put_batch(merged.clone());
            if promote_to_distributed {
                let _ = self
                    .with_tier_timeout("distributed", self.distributed.put_batch(&merged))
                    .await;
            }
        }
        debug!(
            entity_type = %query.entity_type,
            tier = %answering_tier,
            entries = merged.len(),
            partial,
            "Range query answered"
        );

        Ok(TierResult {
            entries: merged,
            answering_tier,
            partial,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Nearest at-or-before point lookup for one entity.
    ///
    /// A cached candidate proves it is the nearest only when it sits exactly
    /// at the probed timestamp; anything older may be shadowed by a newer
    /// entry the cache never saw, so the walk consults every tier and keeps
    /// the newest candidate. A record outage falls back to the best cached
    /// candidate instead of failing, matching the range-query degradation.
    pub async fn at(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        timestamp: i64,
    ) -> Result<Option<TimelineEntry>> {
        fn keep_newest(best: &mut Option<TimelineEntry>, candidate: Option<TimelineEntry>) {
            if let Some(candidate) = candidate {
                if best
                    .as_ref()
                    .map_or(true, |b| candidate.timestamp > b.timestamp)
                {
                    *best = Some(candidate);
                }
            }
        }

        let query = TimeRangeQuery::range(entity_type, 0, timestamp).for_entity(entity_id);
        query.validate()?;
        self.total_queries.fetch_add(1, Ordering::Relaxed);

        let exact =
            |best: &Option<TimelineEntry>| best.as_ref().map_or(false, |b| b.timestamp == timestamp);
        let mut best: Option<TimelineEntry> = None;

        'tiers: {
            let hot = self.hot.query(&query).into_iter().last();
            if hot.is_some() {
                self.hot_stats.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.hot_stats.misses.fetch_add(1, Ordering::Relaxed);
            }
            keep_newest(&mut best, hot);
            if exact(&best) {
                break 'tiers;
            }

            match self
                .with_tier_timeout("distributed", self.distributed.query_range(&query))
                .await
            {
                Ok(entries) => keep_newest(&mut best, entries.into_iter().last()),
                Err(e) => {
                    self.distributed_degraded.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Distributed tier degraded during point lookup");
                }
            }
            if exact(&best) {
                break 'tiers;
            }

            match self.with_tier_timeout("snapshot", self.snapshot_query(&query)).await {
                Ok(entries) => keep_newest(&mut best, entries.into_iter().last()),
                Err(e) => warn!(error = %e, "Snapshot tier degraded during point lookup"),
            }
            if exact(&best) {
                break 'tiers;
            }

            match self.record.query_range(&query).await {
                Ok(entries) => keep_newest(&mut best, entries.into_iter().last()),
                Err(e) => {
                    if best.is_none() {
                        return Err(TempoError::DataUnavailable(e.to_string()));
                    }
                    warn!(error = %e, "System of record unavailable; returning cached nearest");
                }
            }
        }

        if let Some(entry) = &best {
            self.hot.put(entry.clone());
        }
        Ok(best)
    }

    /// Full timeline for one entity.
    pub async fn entity(&self, entity_type: EntityType, entity_id: &str) -> Result<TierResult> {
        let query =
            TimeRangeQuery::range(entity_type, 0, self.clock.now_ms()).for_entity(entity_id);
        self.query_range(&query).await
    }

    /// Answer multiple range queries in one call.
    pub async fn batch(&self, queries: &[TimeRangeQuery]) -> Vec<Result<TierResult>> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(self.query_range(query).await);
        }
        results
    }

    fn validate_ingest(entry: &TimelineEntry) -> Result<()> {
        if entry.entity_id.is_empty() {
            return Err(TempoError::InvalidQuery(
                "ingest entry missing entity_id".to_string(),
            ));
        }
        if entry.entity_type.as_str().is_empty() {
            return Err(TempoError::InvalidQuery(
                "ingest entry missing entity_type".to_string(),
            ));
        }
        if !entry.data.is_object() {
            return Err(TempoError::InvalidQuery(
                "ingest entry data must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }

    /// Write-through ingest: hot synchronously, distributed sync or async per
    /// config, open snapshot bucket, system of record, then live fan-out.
    /// The system-of-record write is awaited and its failure propagates.
    pub async fn ingest(&self, mut entries: Vec<TimelineEntry>) -> Result<usize> {
        let now = self.clock.now_ms();
        for entry in entries.iter_mut() {
            Self::validate_ingest(entry)?;
            if entry.approx_size_bytes == 0 {
                entry.approx_size_bytes = entry.estimate_size();
            }
            entry.last_accessed_at = now;
            if matches!(entry.source, DataSource::Cached) {
                entry.source = DataSource::Live;
            }
        }
        // Per-entity fan-out order must be non-decreasing in timestamp.
        entries.sort_by_key(|e| (e.timestamp, e.entity_id.clone()));

        self.hot.put_batch(entries.clone());
        self.snapshots.append_open(&entries);
        self.record.write_batch(&entries).await?;

        if self.timeline().distributed_write_sync {
            if let Err(e) = self
                .with_tier_timeout("distributed", self.distributed.put_batch(&entries))
                .await
            {
                self.distributed_degraded.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Distributed write failed; degrading to other tiers");
            }
        } else {
            let distributed = self.distributed.clone();
            let batch = entries.clone();
            tokio::spawn(async move {
                if let Err(e) = distributed.put_batch(&batch).await {
                    warn!(error = %e, "Async distributed write failed");
                }
            });
        }

        for entry in &entries {
            self.fanout.publish(LiveUpdateMessage::from_entry(entry));
        }

        let count = entries.len();
        self.ingested.fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    /// Administrative cache-bust for corrected historical data. The system
    /// of record is never touched.
    pub async fn invalidate(
        &self,
        entity_type: &EntityType,
        entity_id: Option<&str>,
        before: Option<i64>,
    ) -> Result<InvalidationSummary> {
        let hot = self.hot.invalidate(entity_type, entity_id);
        let distributed = match self
            .with_tier_timeout(
                "distributed",
                self.distributed.invalidate(entity_type, entity_id, before),
            )
            .await
        {
            Ok(n) => n,
            Err(e) => {
                self.distributed_degraded.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Distributed invalidation failed");
                0
            }
        };
        let snapshot = self.snapshots.invalidate(entity_type, entity_id, before)?;

        info!(
            entity_type = %entity_type,
            entity_id = entity_id.unwrap_or("*"),
            hot, distributed, snapshot,
            "Invalidated cached entries"
        );
        Ok(InvalidationSummary {
            hot,
            distributed,
            snapshot,
        })
    }

    pub async fn stats(&self) -> TierStatsSnapshot {
        let mut tiers = HashMap::new();
        tiers.insert(Tier::Hot.to_string(), self.hot_stats.snapshot());
        tiers.insert(
            Tier::Distributed.to_string(),
            self.distributed_stats.snapshot(),
        );
        tiers.insert(Tier::Snapshot.to_string(), self.snapshot_stats.snapshot());
        tiers.insert(
            Tier::SystemOfRecord.to_string(),
            self.record_stats.snapshot(),
        );

        let total = self.total_queries.load(Ordering::Relaxed);
        let cache_hits = self.hot_stats.hits.load(Ordering::Relaxed)
            + self.distributed_stats.hits.load(Ordering::Relaxed)
            + self.snapshot_stats.hits.load(Ordering::Relaxed);

        TierStatsSnapshot {
            tiers,
            hot_entries: self.hot.len(),
            distributed_healthy: self.distributed.is_healthy().await,
            distributed_degraded_count: self.distributed_degraded.load(Ordering::Relaxed),
            record_healthy: self.record.is_healthy().await,
            snapshot: self.snapshots.stats(),
            total_queries: total,
            ingested_entries: self.ingested.load(Ordering::Relaxed),
            live_subscribers: self.fanout.subscriber_count(),
            overall_cache_hit_rate: if total > 0 {
                cache_hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Spawn the periodic maintenance tasks: hot-tier purge, snapshot bucket
    /// sealing, and retention enforcement. Handles are kept for shutdown.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let purge = {
            let service = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                loop {
                    ticker.tick().await;
                    let removed = service.hot.purge_expired();
                    if removed > 0 {
                        debug!(removed, "Purged expired hot-cache entries");
                    }
                }
            })
        };
        tasks.push(purge);

        let sealer = {
            let service = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                loop {
                    ticker.tick().await;
                    // Seal and retention passes write and delete archive
                    // files, so they run on the blocking pool.
                    let snapshots = service.snapshots.clone();
                    let pass = tokio::task::spawn_blocking(move || {
                        snapshots.seal_elapsed()?;
                        snapshots.enforce_retention()
                    })
                    .await;
                    match pass {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "Snapshot maintenance pass failed"),
                        Err(e) => warn!(error = %e, "Snapshot maintenance task failed"),
                    }
                }
            })
        };
        tasks.push(sealer);
    }

    pub fn stop_background_tasks(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
