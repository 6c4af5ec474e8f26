//! Scrub-aware time window loader
//!
//! Frontends drag a timeline cursor far faster than fetches can complete.
//! Every scrub bumps a generation counter and waits out a short throttle;
//! a call that wakes to find a newer generation is superseded and does no
//! work, so only the final resting position triggers fetches. Loading is
//! chunked and ascending, and checks the generation between chunks so a new
//! scrub cancels a fill already in progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use tempo_core::{EntityType, Result, TimeRangeQuery};

use crate::manager::CacheManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Chunks actually fetched (covered chunks are skipped).
    pub loaded_chunks: usize,
    /// A newer scrub superseded this one before or during the fill.
    pub superseded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Fill passes that actually ran (not superseded at the throttle).
    pub evaluations: u64,
    pub chunks_loaded: u64,
    pub superseded_scrubs: u64,
}

pub struct TimeWindowLoader {
    manager: Arc<CacheManager>,
    entity_type: EntityType,
    entity_id: Option<String>,
    generation: AtomicU64,
    evaluations: AtomicU64,
    chunks_loaded: AtomicU64,
    superseded_scrubs: AtomicU64,
}

impl TimeWindowLoader {
    pub fn new(
        manager: Arc<CacheManager>,
        entity_type: EntityType,
        entity_id: Option<String>,
    ) -> Self {
        Self {
            manager,
            entity_type,
            entity_id,
            generation: AtomicU64::new(0),
            evaluations: AtomicU64::new(0),
            chunks_loaded: AtomicU64::new(0),
            superseded_scrubs: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            chunks_loaded: self.chunks_loaded.load(Ordering::Relaxed),
            superseded_scrubs: self.superseded_scrubs.load(Ordering::Relaxed),
        }
    }

    /// The window kept loaded around a scrub position: one chunk behind for
    /// backward nudges, the configured lookahead in front.
    fn window(&self, position: i64) -> (i64, i64) {
        let config = self.manager.config();
        (
            position.saturating_sub(config.chunk_size_ms),
            position.saturating_add(config.prefetch_lookahead_ms),
        )
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Debounced scrub handler. Returns immediately-superseded outcomes
    /// without fetching anything.
    pub async fn scrub_to(&self, position: i64) -> Result<LoadOutcome> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let throttle = Duration::from_millis(self.manager.config().scrub_throttle_ms);
        tokio::time::sleep(throttle).await;

        if self.current_generation() != generation {
            self.superseded_scrubs.fetch_add(1, Ordering::Relaxed);
            return Ok(LoadOutcome {
                loaded_chunks: 0,
                superseded: true,
            });
        }

        let (start, end) = self.window(position);
        self.fill(generation, start, end).await
    }

    /// Snap to the live edge without debouncing.
    pub async fn jump_to_live(&self) -> Result<LoadOutcome> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.manager.clock().now_ms();
        let start = now.saturating_sub(self.manager.config().chunk_size_ms);
        self.fill(generation, start, now).await
    }

    /// Fetch the uncovered chunks of `[start, end)` in ascending order,
    /// aborting between chunks if a newer scrub arrives.
    async fn fill(&self, generation: u64, start: i64, end: i64) -> Result<LoadOutcome> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let chunk_ms = self.manager.config().chunk_size_ms.max(1);
        let gaps =
            self.manager
                .missing_ranges(&self.entity_type, self.entity_id.as_deref(), start, end);

        let mut loaded = 0;
        for (gap_start, gap_end) in gaps {
            let mut chunk_start = gap_start;
            while chunk_start < gap_end {
                if self.current_generation() != generation {
                    debug!(loaded, "Window fill superseded by a newer scrub");
                    self.superseded_scrubs.fetch_add(1, Ordering::Relaxed);
                    return Ok(LoadOutcome {
                        loaded_chunks: loaded,
                        superseded: true,
                    });
                }

                let chunk_end = (chunk_start + chunk_ms).min(gap_end);
                let mut query =
                    TimeRangeQuery::range(self.entity_type.clone(), chunk_start, chunk_end - 1);
                if let Some(entity_id) = &self.entity_id {
                    query = query.for_entity(entity_id.clone());
                }
                self.manager.query_range(&query).await?;
                loaded += 1;
                self.chunks_loaded.fetch_add(1, Ordering::Relaxed);
                chunk_start = chunk_end;
            }
        }

        debug!(loaded, start, end, "Window fill complete");
        Ok(LoadOutcome {
            loaded_chunks: loaded,
            superseded: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempo_core::{
        ManualClock, TempoError, Tier, TierResult, TimelineConfig, TimelineEntry,
    };

    use crate::remote::RemoteApi;

    const START: i64 = 1_770_388_200_000;

    #[derive(Default)]
    struct RecordingRemote {
        ranges: Mutex<Vec<(i64, i64)>>,
    }

    #[async_trait]
    impl RemoteApi for RecordingRemote {
        async fn query_range(&self, query: &TimeRangeQuery) -> Result<TierResult> {
            self.ranges
                .lock()
                .unwrap()
                .push((query.start_time, query.end_time));
            Ok(TierResult {
                entries: vec![TimelineEntry::new(
                    EntityType::Aircraft,
                    "N1",
                    query.start_time,
                    json!({"alt": 1}),
                )],
                answering_tier: Tier::Hot,
                partial: false,
                latency_ms: 1.0,
            })
        }

        async fn entry_at(
            &self,
            _entity_type: &EntityType,
            _entity_id: &str,
            _timestamp: i64,
        ) -> Result<Option<TimelineEntry>> {
            Err(TempoError::Internal("not used".to_string()))
        }
    }

    fn loader(remote: Arc<RecordingRemote>) -> TimeWindowLoader {
        let clock = Arc::new(ManualClock::new(START));
        let manager = Arc::new(CacheManager::new(
            TimelineConfig::default(),
            clock,
            remote,
            None,
        ));
        TimeWindowLoader::new(manager, EntityType::Aircraft, Some("N1".to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn fills_chunks_ascending() {
        let remote = Arc::new(RecordingRemote::default());
        let loader = loader(remote.clone());

        // chunk 300s behind + 600s lookahead = 3 chunks of 300s.
        let outcome = loader.scrub_to(START).await.unwrap();
        assert_eq!(
            outcome,
            LoadOutcome {
                loaded_chunks: 3,
                superseded: false
            }
        );

        let ranges = remote.ranges.lock().unwrap().clone();
        assert_eq!(ranges.len(), 3);
        assert!(ranges.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(ranges[0].0, START - 300_000);
        assert_eq!(ranges[2].1, START + 600_000 - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_scrubs_debounce_to_the_last_position() {
        let remote = Arc::new(RecordingRemote::default());
        let loader = Arc::new(loader(remote.clone()));

        let early = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.scrub_to(START - 10_000_000).await })
        };
        // Let the first scrub reach its throttle sleep before superseding it.
        tokio::task::yield_now().await;

        let late = loader.scrub_to(START).await.unwrap();
        assert!(!late.superseded);

        let early = early.await.unwrap().unwrap();
        assert!(early.superseded);
        assert_eq!(early.loaded_chunks, 0);
        assert_eq!(loader.stats().superseded_scrubs, 1);
        assert_eq!(loader.stats().evaluations, 1);

        // Only the final position was fetched.
        let ranges = remote.ranges.lock().unwrap().clone();
        assert!(ranges.iter().all(|(s, _)| *s >= START - 300_000));
    }

    #[tokio::test(start_paused = true)]
    async fn covered_window_loads_nothing() {
        let remote = Arc::new(RecordingRemote::default());
        let loader = loader(remote.clone());

        loader.scrub_to(START).await.unwrap();
        let first_calls = remote.ranges.lock().unwrap().len();

        // Same position again: the whole window is covered now.
        let outcome = loader.scrub_to(START).await.unwrap();
        assert_eq!(outcome.loaded_chunks, 0);
        assert_eq!(remote.ranges.lock().unwrap().len(), first_calls);
    }

    #[tokio::test(start_paused = true)]
    async fn jump_to_live_skips_the_throttle() {
        let remote = Arc::new(RecordingRemote::default());
        let loader = loader(remote.clone());

        let outcome = loader.jump_to_live().await.unwrap();
        assert!(!outcome.superseded);
        assert_eq!(outcome.loaded_chunks, 1);
    }
}
