//! End-to-end tier behavior through `TimelineService`

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use tempo_core::{
    EntityType, ManualClock, Tier, TimeRangeQuery, TimelineConfig, TimelineEntry,
};
use timeline_service::{
    InMemoryRecordStore, LiveEvent, ServiceConfig, SharedCache, SubscriptionFilter,
    TimelineService,
};

// 2026-02-06T14:30:00Z
const START: i64 = 1_770_388_200_000;
const HOUR_MS: i64 = 3_600_000;

struct Harness {
    service: Arc<TimelineService>,
    clock: Arc<ManualClock>,
    distributed: Arc<SharedCache>,
    record: Arc<InMemoryRecordStore>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(START));

    let mut timeline = TimelineConfig::default();
    // Deterministic tests: the distributed write on ingest is awaited.
    timeline.distributed_write_sync = true;
    let config = ServiceConfig {
        service_name: "timeline-service".to_string(),
        http_port: 0,
        log_level: "debug".to_string(),
        snapshot_dir: dir.path().to_string_lossy().into_owned(),
        timeline,
    };

    let distributed = Arc::new(SharedCache::new(
        config.timeline.distributed_cache_ttl_ms(),
        clock.clone(),
    ));
    let record = Arc::new(InMemoryRecordStore::new());
    let service = Arc::new(
        TimelineService::new(
            config,
            clock.clone(),
            distributed.clone(),
            record.clone(),
        )
        .unwrap(),
    );

    Harness {
        service,
        clock,
        distributed,
        record,
        _dir: dir,
    }
}

fn entry(id: &str, ts: i64) -> TimelineEntry {
    TimelineEntry::new(EntityType::Aircraft, id, ts, json!({"lat": 10.0, "ts": ts}))
}

#[tokio::test]
async fn cold_miss_falls_through_to_record_then_promotes() {
    let h = harness();
    h.record
        .seed(vec![entry("N1", START - 100), entry("N1", START - 50)])
        .await;

    let q = TimeRangeQuery::range(EntityType::Aircraft, START - 200, START).for_entity("N1");

    let first = h.service.query_range(&q).await.unwrap();
    assert_eq!(first.answering_tier, Tier::SystemOfRecord);
    assert_eq!(first.entries.len(), 2);
    assert!(!first.partial);

    // Promotion makes the identical repeat a hot-tier answer.
    let second = h.service.query_range(&q).await.unwrap();
    assert_eq!(second.answering_tier, Tier::Hot);
    assert_eq!(second.entries, first.entries);
}

#[tokio::test]
async fn point_lookup_returns_nearest_at_or_before() {
    let h = harness();
    h.service
        .ingest(vec![
            entry("N1", START + 1000),
            entry("N1", START + 1010),
            entry("N1", START + 1020),
        ])
        .await
        .unwrap();

    let hit = h
        .service
        .at(EntityType::Aircraft, "N1", START + 1015)
        .await
        .unwrap();
    assert_eq!(hit.unwrap().timestamp, START + 1010);

    let before_all = h
        .service
        .at(EntityType::Aircraft, "N1", START + 999)
        .await
        .unwrap();
    assert!(before_all.is_none());
}

#[tokio::test]
async fn point_lookup_deepens_past_a_stale_hot_candidate() {
    let h = harness();
    h.record
        .seed(vec![entry("N1", START + 500), entry("N1", START + 1010)])
        .await;

    // A narrow range query promotes only the older point into the hot tier.
    let q = TimeRangeQuery::range(EntityType::Aircraft, START, START + 600).for_entity("N1");
    assert_eq!(h.service.query_range(&q).await.unwrap().entries.len(), 1);

    // The true nearest at-or-before lives past the hot candidate; the walk
    // must keep deepening instead of trusting the first non-empty tier.
    let hit = h
        .service
        .at(EntityType::Aircraft, "N1", START + 1015)
        .await
        .unwrap();
    assert_eq!(hit.unwrap().timestamp, START + 1010);
}

#[tokio::test]
async fn distributed_outage_degrades_instead_of_failing() {
    let h = harness();
    h.record.seed(vec![entry("N1", START - 10)]).await;
    h.distributed.set_unreachable(true);

    let q = TimeRangeQuery::range(EntityType::Aircraft, START - 100, START);
    let result = h.service.query_range(&q).await.unwrap();
    assert_eq!(result.answering_tier, Tier::SystemOfRecord);
    assert_eq!(result.entries.len(), 1);

    let stats = h.service.stats().await;
    assert!(!stats.distributed_healthy);
    assert!(stats.distributed_degraded_count >= 1);
}

#[tokio::test]
async fn sealed_snapshot_answers_after_cache_tiers_expire() {
    let h = harness();
    h.service
        .ingest(vec![entry("N1", START), entry("N1", START + 60_000)])
        .await
        .unwrap();

    // Past hot TTL and distributed TTL; the sealed archive is the only
    // cache tier left holding the data.
    h.clock.advance(25 * HOUR_MS);
    assert!(h.service.snapshots().seal_elapsed().unwrap() >= 1);

    let q = TimeRangeQuery::range(EntityType::Aircraft, START - 1000, START + HOUR_MS);
    let result = h.service.query_range(&q).await.unwrap();
    assert_eq!(result.answering_tier, Tier::Snapshot);
    assert_eq!(result.entries.len(), 2);

    // And the archive answer was promoted back into the hot tier.
    let repeat = h.service.query_range(&q).await.unwrap();
    assert_eq!(repeat.answering_tier, Tier::Hot);
}

#[tokio::test]
async fn snapshot_answers_through_a_distributed_outage() {
    let h = harness();
    h.service
        .ingest(vec![entry("N1", START), entry("N1", START + 60_000)])
        .await
        .unwrap();

    // Hot and distributed TTLs lapse; the sealed archive alone holds the
    // data, and the distributed tier is down on top of it.
    h.clock.advance(25 * HOUR_MS);
    assert!(h.service.snapshots().seal_elapsed().unwrap() >= 1);
    h.distributed.set_unreachable(true);

    let q = TimeRangeQuery::range(EntityType::Aircraft, START - 1000, START + HOUR_MS);
    let result = h.service.query_range(&q).await.unwrap();
    assert_eq!(result.answering_tier, Tier::Snapshot);
    assert_eq!(result.entries.len(), 2);
    assert!(!result.partial);

    let stats = h.service.stats().await;
    assert!(!stats.distributed_healthy);
    assert!(stats.distributed_degraded_count >= 1);
}

#[tokio::test]
async fn full_miss_with_record_outage_is_data_unavailable() {
    let h = harness();
    h.record.set_unreachable(true);

    let q = TimeRangeQuery::range(EntityType::Aircraft, 0, START);
    let err = h.service.query_range(&q).await.unwrap_err();
    assert_eq!(err.error_code(), "DATA_UNAVAILABLE");
}

#[tokio::test]
async fn limit_unmet_with_record_outage_yields_partial() {
    let h = harness();
    h.service.ingest(vec![entry("N1", START)]).await.unwrap();
    h.record.set_unreachable(true);

    let q = TimeRangeQuery::range(EntityType::Aircraft, START - HOUR_MS, START + 1).with_limit(5);
    let result = h.service.query_range(&q).await.unwrap();
    assert!(result.partial);
    assert_eq!(result.entries.len(), 1);
}

#[tokio::test]
async fn limit_deepens_past_a_non_empty_cache_tier() {
    let h = harness();
    h.record
        .seed(vec![entry("N1", START - 500), entry("N1", START - 400)])
        .await;
    h.service.ingest(vec![entry("N1", START - 10)]).await.unwrap();

    let q = TimeRangeQuery::range(EntityType::Aircraft, START - 1000, START).with_limit(3);
    let result = h.service.query_range(&q).await.unwrap();
    assert_eq!(result.entries.len(), 3);
    assert!(result
        .entries
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
    // The hot tier contributed first even though the record completed the set.
    assert_eq!(result.answering_tier, Tier::Hot);
}

#[tokio::test]
async fn invalidation_forces_a_record_refetch() {
    let h = harness();
    h.service
        .ingest(vec![entry("N1", START - 20), entry("N1", START - 10)])
        .await
        .unwrap();

    let summary = h
        .service
        .invalidate(&EntityType::Aircraft, None, None)
        .await
        .unwrap();
    assert_eq!(summary.hot, 2);
    assert_eq!(summary.distributed, 2);

    // The system of record is untouched and repopulates the caches.
    let q = TimeRangeQuery::range(EntityType::Aircraft, START - 100, START);
    let result = h.service.query_range(&q).await.unwrap();
    assert_eq!(result.answering_tier, Tier::SystemOfRecord);
    assert_eq!(result.entries.len(), 2);
}

#[tokio::test]
async fn ingest_failure_propagates_when_record_is_down() {
    let h = harness();
    h.record.set_unreachable(true);

    let err = h.service.ingest(vec![entry("N1", START)]).await.unwrap_err();
    assert_eq!(err.error_code(), "DATA_UNAVAILABLE");
}

#[tokio::test]
async fn ingest_fans_out_in_timestamp_order() {
    let h = harness();
    let mut stream = h
        .service
        .fanout()
        .subscribe(SubscriptionFilter::for_entity(EntityType::Aircraft, "N1"));

    // Deliberately unsorted batch.
    h.service
        .ingest(vec![
            entry("N1", START + 30),
            entry("N1", START + 10),
            entry("N1", START + 20),
        ])
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        match stream.recv().await.unwrap() {
            LiveEvent::Update(msg) => seen.push(msg.timestamp),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(seen, vec![START + 10, START + 20, START + 30]);
}

#[tokio::test]
async fn rejects_malformed_queries_locally() {
    let h = harness();
    let q = TimeRangeQuery::range(EntityType::Aircraft, START, START - 1);
    let err = h.service.query_range(&q).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_QUERY");

    // No tier was touched.
    let stats = h.service.stats().await;
    let hot = &stats.tiers[Tier::Hot.as_str()];
    assert_eq!(hot.hits + hot.misses, 0);
}
