//! Configuration management for cache tiers and loaders

use serde::Deserialize;
use std::env;
use std::str::FromStr;

use crate::error::{Result, TempoError};

/// Tunables for every cache tier and the client-side loader.
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineConfig {
    pub hot_cache_ttl_seconds: u64,
    pub hot_cache_max_entries: usize,
    pub persistent_cache_ttl_hours: u64,
    pub persistent_cache_max_bytes: u64,
    pub distributed_cache_ttl_hours: u64,
    /// When true, the distributed-tier write on ingest is awaited; otherwise
    /// it is enqueued asynchronously.
    pub distributed_write_sync: bool,
    pub snapshot_bucket_hours: u64,
    pub snapshot_retention_days: u64,
    pub prefetch_lookahead_ms: i64,
    pub scrub_throttle_ms: u64,
    pub chunk_size_ms: i64,
    pub live_queue_depth: usize,
    /// Timeout applied to every non-final tier call; a timeout is a miss.
    pub tier_timeout_ms: u64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            hot_cache_ttl_seconds: 300,
            hot_cache_max_entries: 10_000,
            persistent_cache_ttl_hours: 24,
            persistent_cache_max_bytes: 100 * 1024 * 1024,
            distributed_cache_ttl_hours: 24,
            distributed_write_sync: false,
            snapshot_bucket_hours: 1,
            snapshot_retention_days: 7,
            prefetch_lookahead_ms: 600_000,
            scrub_throttle_ms: 100,
            chunk_size_ms: 300_000,
            live_queue_depth: 256,
            tier_timeout_ms: 250,
        }
    }
}

impl TimelineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            hot_cache_ttl_seconds: env_parse(
                "TEMPO_HOT_CACHE_TTL_SECONDS",
                defaults.hot_cache_ttl_seconds,
            )?,
            hot_cache_max_entries: env_parse(
                "TEMPO_HOT_CACHE_MAX_ENTRIES",
                defaults.hot_cache_max_entries,
            )?,
            persistent_cache_ttl_hours: env_parse(
                "TEMPO_PERSISTENT_CACHE_TTL_HOURS",
                defaults.persistent_cache_ttl_hours,
            )?,
            persistent_cache_max_bytes: env_parse(
                "TEMPO_PERSISTENT_CACHE_MAX_BYTES",
                defaults.persistent_cache_max_bytes,
            )?,
            distributed_cache_ttl_hours: env_parse(
                "TEMPO_DISTRIBUTED_CACHE_TTL_HOURS",
                defaults.distributed_cache_ttl_hours,
            )?,
            distributed_write_sync: env_parse(
                "TEMPO_DISTRIBUTED_WRITE_SYNC",
                defaults.distributed_write_sync,
            )?,
            snapshot_bucket_hours: env_parse(
                "TEMPO_SNAPSHOT_BUCKET_HOURS",
                defaults.snapshot_bucket_hours,
            )?,
            snapshot_retention_days: env_parse(
                "TEMPO_SNAPSHOT_RETENTION_DAYS",
                defaults.snapshot_retention_days,
            )?,
            prefetch_lookahead_ms: env_parse(
                "TEMPO_PREFETCH_LOOKAHEAD_MS",
                defaults.prefetch_lookahead_ms,
            )?,
            scrub_throttle_ms: env_parse("TEMPO_SCRUB_THROTTLE_MS", defaults.scrub_throttle_ms)?,
            chunk_size_ms: env_parse("TEMPO_CHUNK_SIZE_MS", defaults.chunk_size_ms)?,
            live_queue_depth: env_parse("TEMPO_LIVE_QUEUE_DEPTH", defaults.live_queue_depth)?,
            tier_timeout_ms: env_parse("TEMPO_TIER_TIMEOUT_MS", defaults.tier_timeout_ms)?,
        })
    }

    pub fn hot_cache_ttl_ms(&self) -> i64 {
        self.hot_cache_ttl_seconds as i64 * 1_000
    }

    pub fn persistent_cache_ttl_ms(&self) -> i64 {
        self.persistent_cache_ttl_hours as i64 * 3_600_000
    }

    pub fn distributed_cache_ttl_ms(&self) -> i64 {
        self.distributed_cache_ttl_hours as i64 * 3_600_000
    }

    pub fn snapshot_bucket_ms(&self) -> i64 {
        self.snapshot_bucket_hours as i64 * 3_600_000
    }

    pub fn snapshot_retention_ms(&self) -> i64 {
        self.snapshot_retention_days as i64 * 86_400_000
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| TempoError::Config(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognized_options() {
        let cfg = TimelineConfig::default();
        assert_eq!(cfg.hot_cache_ttl_seconds, 300);
        assert_eq!(cfg.persistent_cache_max_bytes, 104_857_600);
        assert_eq!(cfg.snapshot_bucket_ms(), 3_600_000);
        assert_eq!(cfg.snapshot_retention_ms(), 7 * 86_400_000);
        assert_eq!(cfg.prefetch_lookahead_ms, 600_000);
        assert_eq!(cfg.scrub_throttle_ms, 100);
        assert_eq!(cfg.chunk_size_ms, 300_000);
        assert_eq!(cfg.live_queue_depth, 256);
    }

    #[test]
    fn env_parse_rejects_garbage() {
        std::env::set_var("TEMPO_TEST_BAD_NUMBER", "not-a-number");
        let res: Result<u64> = env_parse("TEMPO_TEST_BAD_NUMBER", 5);
        assert!(res.is_err());
        std::env::remove_var("TEMPO_TEST_BAD_NUMBER");
    }
}
