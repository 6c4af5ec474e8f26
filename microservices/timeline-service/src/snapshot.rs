//! Snapshot archive - compressed, hour-bucketed historical cache
//!
//! Buckets are aligned to fixed UTC hour boundaries so keys are
//! deterministic regardless of caller timezone. A bucket is open while its
//! window still includes "now" and accumulates entries in memory; once the
//! window fully elapses the sealer serializes, compresses, and writes it as
//! one immutable archive unit. A lightweight metadata index allows existence
//! checks without decompression.
//!
//! Layout: `{base}/{entity_type}/{YYYY-MM-DD}/{HH}.json.gz` plus
//! `{base}/index.json`.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use tempo_core::{Clock, EntityType, EntryKey, Result, TimeRangeQuery, TimelineEntry};

const INDEX_FILE: &str = "index.json";

/// Metadata for one sealed bucket; enough to answer existence checks and
/// size accounting without touching the archive payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub entity_type: String,
    pub bucket_start: i64,
    pub bucket_end: i64,
    pub entry_count: usize,
    pub byte_size: u64,
    pub created_at: i64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotStats {
    pub sealed_buckets: usize,
    pub open_buckets: usize,
    pub total_entries: usize,
    pub total_bytes: u64,
    pub total_bytes_human: String,
    pub by_entity_type: HashMap<String, EntityTypeStats>,
    pub oldest_bucket_ms: Option<i64>,
    pub newest_bucket_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityTypeStats {
    pub buckets: usize,
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Default)]
struct OpenBuckets {
    /// bucket key -> composite entry key -> entry (upsert semantics)
    buckets: HashMap<String, HashMap<EntryKey, TimelineEntry>>,
}

/// Snapshot archive manager.
pub struct SnapshotStore {
    base_dir: PathBuf,
    bucket_ms: i64,
    retention_ms: i64,
    clock: Arc<dyn Clock>,
    index: Mutex<HashMap<String, SnapshotMetadata>>,
    open: Mutex<OpenBuckets>,
}

impl SnapshotStore {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        bucket_ms: i64,
        retention_ms: i64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;

        let store = Self {
            base_dir,
            bucket_ms,
            retention_ms,
            clock,
            index: Mutex::new(HashMap::new()),
            open: Mutex::new(OpenBuckets::default()),
        };
        store.load_index()?;
        Ok(store)
    }

    fn load_index(&self) -> Result<()> {
        let path = self.base_dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(());
        }
        let raw = fs::read_to_string(&path)?;
        let loaded: HashMap<String, SnapshotMetadata> = serde_json::from_str(&raw)?;
        info!(buckets = loaded.len(), "Loaded snapshot index");
        *self.index.lock() = loaded;
        Ok(())
    }

    fn save_index(&self, index: &HashMap<String, SnapshotMetadata>) -> Result<()> {
        let path = self.base_dir.join(INDEX_FILE);
        let raw = serde_json::to_string_pretty(index)?;
        fs::write(&path, raw)?;
        Ok(())
    }

    /// Align a timestamp down to its bucket boundary.
    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - timestamp_ms.rem_euclid(self.bucket_ms)
    }

    /// Deterministic bucket key, e.g. `aircraft/2026-02-06/14`.
    pub fn bucket_key(&self, entity_type: &EntityType, timestamp_ms: i64) -> String {
        let start = self.bucket_start(timestamp_ms);
        let dt = Utc
            .timestamp_millis_opt(start)
            .single()
            .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
        format!("{}/{}", entity_type, dt.format("%Y-%m-%d/%H"))
    }

    fn bucket_path(&self, bucket_key: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json.gz", bucket_key))
    }

    /// A bucket is open while its window still includes "now".
    fn is_open(&self, bucket_start: i64, now_ms: i64) -> bool {
        now_ms < bucket_start + self.bucket_ms
    }

    /// Route freshly ingested entries into their open buckets. Entries whose
    /// bucket window has already elapsed are archived on the next seal pass
    /// as well, so late arrivals within the same process are not lost.
    pub fn append_open(&self, entries: &[TimelineEntry]) {
        let mut open = self.open.lock();
        for entry in entries {
            let key = self.bucket_key(&entry.entity_type, entry.timestamp);
            open.buckets
                .entry(key)
                .or_default()
                .insert(entry.key(), entry.clone());
        }
    }

    /// Seal every open bucket whose window has fully elapsed: serialize,
    /// compress, write, and index. Returns the number of buckets sealed.
    pub fn seal_elapsed(&self) -> Result<usize> {
        let now_ms = self.clock.now_ms();
        let to_seal: Vec<(String, Vec<TimelineEntry>)> = {
            let mut open = self.open.lock();
            let elapsed: Vec<String> = open
                .buckets
                .iter()
                .filter(|(_, entries)| {
                    entries
                        .values()
                        .next()
                        .map(|e| !self.is_open(self.bucket_start(e.timestamp), now_ms))
                        .unwrap_or(false)
                })
                .map(|(key, _)| key.clone())
                .collect();

            elapsed
                .into_iter()
                .filter_map(|key| {
                    open.buckets.remove(&key).map(|entries| {
                        let mut sorted: Vec<TimelineEntry> = entries.into_values().collect();
                        sorted.sort_by_key(|e| (e.timestamp, e.entity_id.clone()));
                        (key, sorted)
                    })
                })
                .collect()
        };

        let mut sealed = 0;
        for (bucket_key, entries) in to_seal {
            match self.seal_bucket(&bucket_key, &entries) {
                Ok(()) => sealed += 1,
                Err(e) => error!(bucket = %bucket_key, error = %e, "Failed to seal bucket"),
            }
        }
        Ok(sealed)
    }

    /// Seal every open bucket regardless of its window, used on shutdown so
    /// in-memory entries reach disk. A partially filled bucket written here
    /// is replaced wholesale if the process restarts within the same window
    /// and re-seals it with more entries.
    pub fn seal_all(&self) -> Result<usize> {
        let to_seal: Vec<(String, Vec<TimelineEntry>)> = {
            let mut open = self.open.lock();
            let keys: Vec<String> = open.buckets.keys().cloned().collect();
            keys.into_iter()
                .filter_map(|key| {
                    open.buckets.remove(&key).map(|entries| {
                        let mut sorted: Vec<TimelineEntry> = entries.into_values().collect();
                        sorted.sort_by_key(|e| (e.timestamp, e.entity_id.clone()));
                        (key, sorted)
                    })
                })
                .collect()
        };

        let mut sealed = 0;
        for (bucket_key, entries) in to_seal {
            match self.seal_bucket(&bucket_key, &entries) {
                Ok(()) => sealed += 1,
                Err(e) => error!(bucket = %bucket_key, error = %e, "Failed to seal bucket"),
            }
        }
        Ok(sealed)
    }

    fn seal_bucket(&self, bucket_key: &str, entries: &[TimelineEntry]) -> Result<()> {
        let first = match entries.first() {
            Some(e) => e,
            None => return Ok(()),
        };
        let bucket_start = self.bucket_start(first.timestamp);
        let path = self.bucket_path(bucket_key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let raw = serde_json::to_vec(entries)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let compressed = encoder.finish()?;
        let byte_size = compressed.len() as u64;
        fs::write(&path, compressed)?;

        let metadata = SnapshotMetadata {
            entity_type: first.entity_type.to_string(),
            bucket_start,
            bucket_end: bucket_start + self.bucket_ms,
            entry_count: entries.len(),
            byte_size,
            created_at: self.clock.now_ms(),
            path,
        };

        let mut index = self.index.lock();
        index.insert(bucket_key.to_string(), metadata);
        self.save_index(&index)?;
        info!(
            bucket = %bucket_key,
            entries = entries.len(),
            bytes = byte_size,
            "Sealed snapshot bucket"
        );
        Ok(())
    }

    fn read_bucket(&self, path: &Path) -> Result<Vec<TimelineEntry>> {
        let compressed = fs::read(path)?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut raw = Vec::new();
        decoder.read_to_end(&mut raw)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Query the archive: decompress only sealed buckets overlapping the
    /// range (found via the metadata index); a still-open bucket in range
    /// answers from its in-memory entries instead of archive data.
    pub fn query(&self, query: &TimeRangeQuery) -> Result<Vec<TimelineEntry>> {
        let now_ms = self.clock.now_ms();
        let mut results: Vec<TimelineEntry> = Vec::new();

        // Nothing older than the retention floor survives in the archive, so
        // the bucket walk never needs to start before it.
        let scan_from = query.start_time.max(self.retention_floor());
        let scan_to = query.end_time.min(now_ms + self.bucket_ms);
        let mut bucket_start = self.bucket_start(scan_from);
        while bucket_start <= scan_to {
            let bucket_key = self.bucket_key(&query.entity_type, bucket_start);

            if self.is_open(bucket_start, now_ms) {
                let open = self.open.lock();
                if let Some(entries) = open.buckets.get(&bucket_key) {
                    results.extend(
                        entries
                            .values()
                            .filter(|e| query.matches(e) && !e.is_expired(now_ms))
                            .cloned(),
                    );
                }
            } else {
                let path = {
                    let index = self.index.lock();
                    index.get(&bucket_key).map(|m| m.path.clone())
                };
                if let Some(path) = path {
                    let entries = self.read_bucket(&path)?;
                    results.extend(
                        entries
                            .into_iter()
                            .filter(|e| query.matches(e) && !e.is_expired(now_ms)),
                    );
                }
            }

            bucket_start += self.bucket_ms;
        }

        results.sort_by_key(|e| (e.timestamp, e.entity_id.clone()));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Earliest timestamp still covered by retention; older data is only
    /// available from the system of record.
    pub fn retention_floor(&self) -> i64 {
        self.clock.now_ms() - self.retention_ms
    }

    /// Delete sealed buckets older than the retention window.
    pub fn enforce_retention(&self) -> Result<usize> {
        let cutoff = self.retention_floor();
        let mut index = self.index.lock();

        let expired: Vec<String> = index
            .iter()
            .filter(|(_, m)| m.bucket_end < cutoff)
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if let Some(metadata) = index.remove(&key) {
                if let Err(e) = fs::remove_file(&metadata.path) {
                    // Index entry is gone either way; a missing file is fine.
                    debug!(bucket = %key, error = %e, "Snapshot file already gone");
                }
                removed += 1;
            }
        }

        if removed > 0 {
            self.save_index(&index)?;
            info!(removed, "Enforced snapshot retention");
        }
        Ok(removed)
    }

    /// Drop matching open-bucket entries; with an entity-wide scope and a
    /// `before` bound, also delete whole overlapping sealed buckets so the
    /// range re-archives from the system of record. Sealed buckets are never
    /// partially rewritten.
    pub fn invalidate(
        &self,
        entity_type: &EntityType,
        entity_id: Option<&str>,
        before: Option<i64>,
    ) -> Result<u64> {
        let mut removed = 0u64;

        {
            let mut open = self.open.lock();
            for entries in open.buckets.values_mut() {
                let before_len = entries.len();
                entries.retain(|key, _| {
                    !(key.entity_type == *entity_type
                        && entity_id.map_or(true, |id| key.entity_id == id)
                        && before.map_or(true, |b| key.timestamp < b))
                });
                removed += (before_len - entries.len()) as u64;
            }
            open.buckets.retain(|_, entries| !entries.is_empty());
        }

        if entity_id.is_none() {
            let type_name = entity_type.to_string();
            let mut index = self.index.lock();
            let doomed: Vec<String> = index
                .iter()
                .filter(|(_, m)| {
                    m.entity_type == type_name && before.map_or(true, |b| m.bucket_start < b)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in &doomed {
                if let Some(metadata) = index.remove(key) {
                    let _ = fs::remove_file(&metadata.path);
                    removed += metadata.entry_count as u64;
                }
            }
            if !doomed.is_empty() {
                self.save_index(&index)?;
            }
        }

        Ok(removed)
    }

    pub fn stats(&self) -> SnapshotStats {
        let index = self.index.lock();
        let open = self.open.lock();

        let mut by_entity_type: HashMap<String, EntityTypeStats> = HashMap::new();
        let mut total_entries = 0;
        let mut total_bytes = 0;
        let mut oldest = None;
        let mut newest = None;

        for metadata in index.values() {
            total_entries += metadata.entry_count;
            total_bytes += metadata.byte_size;
            let per_type = by_entity_type
                .entry(metadata.entity_type.clone())
                .or_default();
            per_type.buckets += 1;
            per_type.entries += metadata.entry_count;
            per_type.bytes += metadata.byte_size;

            oldest = Some(oldest.map_or(metadata.bucket_start, |o: i64| o.min(metadata.bucket_start)));
            newest = Some(newest.map_or(metadata.bucket_end, |n: i64| n.max(metadata.bucket_end)));
        }

        SnapshotStats {
            sealed_buckets: index.len(),
            open_buckets: open.buckets.len(),
            total_entries,
            total_bytes,
            total_bytes_human: format_bytes(total_bytes),
            by_entity_type,
            oldest_bucket_ms: oldest,
            newest_bucket_ms: newest,
        }
    }
}

fn format_bytes(size: u64) -> String {
    let mut size = size as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{:.1}{}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1}TB", size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempo_core::ManualClock;

    const HOUR_MS: i64 = 3_600_000;
    const WEEK_MS: i64 = 7 * 86_400_000;

    fn store(now_ms: i64) -> (SnapshotStore, Arc<ManualClock>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(now_ms));
        let store = SnapshotStore::new(dir.path(), HOUR_MS, WEEK_MS, clock.clone()).unwrap();
        (store, clock, dir)
    }

    fn entry(id: &str, ts: i64) -> TimelineEntry {
        TimelineEntry::new(
            EntityType::Aircraft,
            id,
            ts,
            json!({"lat": 10.5, "lon": -20.25, "alt": 35000}),
        )
    }

    #[test]
    fn bucket_keys_align_to_utc_hours() {
        let (store, _, _dir) = store(0);
        // 2026-02-06T14:30:00Z
        let ts = 1_770_388_200_000;
        let key = store.bucket_key(&EntityType::Aircraft, ts);
        assert_eq!(key, "aircraft/2026-02-06/14");
        assert_eq!(store.bucket_start(ts) % HOUR_MS, 0);
    }

    #[test]
    fn seal_and_query_round_trip_preserves_fields() {
        let base = 1_770_388_200_000i64; // mid-bucket
        let (store, clock, _dir) = store(base);
        let originals = vec![entry("N1", base), entry("N2", base + 1000)];
        store.append_open(&originals);

        // Window still includes now: nothing seals, open bucket answers.
        assert_eq!(store.seal_elapsed().unwrap(), 0);
        let q = TimeRangeQuery::range(EntityType::Aircraft, base - 10, base + 2000);
        assert_eq!(store.query(&q).unwrap().len(), 2);

        // Advance past the bucket boundary and seal.
        clock.advance(HOUR_MS);
        assert_eq!(store.seal_elapsed().unwrap(), 1);

        let replayed = store.query(&q).unwrap();
        assert_eq!(replayed.len(), 2);
        // Field-for-field identical to the originals.
        assert_eq!(replayed[0], originals[0]);
        assert_eq!(replayed[1], originals[1]);
    }

    #[test]
    fn index_survives_restart_without_decompression() {
        let base = 1_770_388_200_000i64;
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(base));
        {
            let store =
                SnapshotStore::new(dir.path(), HOUR_MS, WEEK_MS, clock.clone()).unwrap();
            store.append_open(&[entry("N1", base)]);
            clock.advance(HOUR_MS);
            store.seal_elapsed().unwrap();
        }

        let reopened = SnapshotStore::new(dir.path(), HOUR_MS, WEEK_MS, clock.clone()).unwrap();
        let stats = reopened.stats();
        assert_eq!(stats.sealed_buckets, 1);
        assert_eq!(stats.total_entries, 1);

        let q = TimeRangeQuery::range(EntityType::Aircraft, base - 10, base + 10);
        assert_eq!(reopened.query(&q).unwrap().len(), 1);
    }

    #[test]
    fn retention_deletes_old_buckets() {
        let base = 1_770_388_200_000i64;
        let (store, clock, _dir) = store(base);
        store.append_open(&[entry("N1", base)]);
        clock.advance(HOUR_MS);
        store.seal_elapsed().unwrap();

        // Not yet past retention.
        assert_eq!(store.enforce_retention().unwrap(), 0);

        clock.advance(WEEK_MS);
        assert_eq!(store.enforce_retention().unwrap(), 1);
        assert_eq!(store.stats().sealed_buckets, 0);

        let q = TimeRangeQuery::range(EntityType::Aircraft, base - 10, base + 10);
        assert!(store.query(&q).unwrap().is_empty());
    }

    #[test]
    fn open_bucket_upserts_are_idempotent() {
        let base = 1_770_388_200_000i64;
        let (store, _clock, _dir) = store(base);
        store.append_open(&[entry("N1", base)]);
        store.append_open(&[entry("N1", base)]);

        let q = TimeRangeQuery::range(EntityType::Aircraft, base - 10, base + 10);
        assert_eq!(store.query(&q).unwrap().len(), 1);
    }

    #[test]
    fn invalidate_drops_open_entries_and_whole_sealed_buckets() {
        let base = 1_770_388_200_000i64;
        let (store, clock, _dir) = store(base);
        store.append_open(&[entry("N1", base)]);
        clock.advance(HOUR_MS);
        store.seal_elapsed().unwrap();

        let now = clock.now_ms();
        store.append_open(&[entry("N1", now)]);

        // Entity-scoped: open entries only, sealed bucket untouched.
        let removed = store
            .invalidate(&EntityType::Aircraft, Some("N1"), None)
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.stats().sealed_buckets, 1);

        // Type-wide: sealed bucket deleted too.
        let removed = store.invalidate(&EntityType::Aircraft, None, None).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.stats().sealed_buckets, 0);
    }
}
