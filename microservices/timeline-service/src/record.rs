//! System of record - authoritative durable store, queried only on full miss

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use tempo_core::{Result, TempoError, TimeRangeQuery, TimelineEntry};

/// Range-query interface over the authoritative store. Always correct but
/// slow; its failures are terminal for a query that reached it.
#[async_trait]
pub trait SystemOfRecord: Send + Sync {
    async fn query_range(&self, query: &TimeRangeQuery) -> Result<Vec<TimelineEntry>>;

    async fn write_batch(&self, entries: &[TimelineEntry]) -> Result<()>;

    async fn is_healthy(&self) -> bool;
}

type RecordKey = (String, String, i64);

/// In-memory system of record for tests and single-host development.
#[derive(Default)]
pub struct InMemoryRecordStore {
    /// (entity_type, entity_id, timestamp) -> entry; BTreeMap gives ordered
    /// range scans per entity.
    state: RwLock<BTreeMap<RecordKey, TimelineEntry>>,
    unreachable: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(TempoError::DataUnavailable(
                "system of record unreachable".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.len()
    }
}

#[async_trait]
impl SystemOfRecord for InMemoryRecordStore {
    async fn query_range(&self, query: &TimeRangeQuery) -> Result<Vec<TimelineEntry>> {
        self.check_reachable()?;
        let state = self.state.read().await;
        let type_name = query.entity_type.to_string();

        let mut results: Vec<TimelineEntry> = match &query.entity_id {
            Some(id) => {
                let lo = (type_name.clone(), id.clone(), query.start_time);
                let hi = (type_name, id.clone(), query.end_time);
                state.range(lo..=hi).map(|(_, e)| e.clone()).collect()
            }
            None => state
                .values()
                .filter(|e| query.matches(e))
                .cloned()
                .collect(),
        };

        results.sort_by_key(|e| (e.timestamp, e.entity_id.clone()));
        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn write_batch(&self, entries: &[TimelineEntry]) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state.write().await;
        for entry in entries {
            let key = (
                entry.entity_type.to_string(),
                entry.entity_id.clone(),
                entry.timestamp,
            );
            state.insert(key, entry.clone());
        }
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.unreachable.load(Ordering::SeqCst)
    }
}

/// Helper for seeding historical data in tests and dev tooling.
impl InMemoryRecordStore {
    pub async fn seed(&self, entries: Vec<TimelineEntry>) {
        let mut state = self.state.write().await;
        for entry in entries {
            let key = (
                entry.entity_type.to_string(),
                entry.entity_id.clone(),
                entry.timestamp,
            );
            state.insert(key, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempo_core::EntityType;

    fn entry(id: &str, ts: i64) -> TimelineEntry {
        TimelineEntry::new(EntityType::Vessel, id, ts, json!({"knots": 12}))
    }

    #[tokio::test]
    async fn range_scan_per_entity() {
        let store = InMemoryRecordStore::new();
        store
            .seed(vec![entry("V1", 100), entry("V1", 200), entry("V2", 150)])
            .await;

        let q = TimeRangeQuery::range(EntityType::Vessel, 50, 180).for_entity("V1");
        let results = store.query_range(&q).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].timestamp, 100);
    }

    #[tokio::test]
    async fn outage_is_data_unavailable() {
        let store = InMemoryRecordStore::new();
        store.set_unreachable(true);
        let err = store
            .query_range(&TimeRangeQuery::range(EntityType::Vessel, 0, 10))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "DATA_UNAVAILABLE");
    }

    #[tokio::test]
    async fn writes_are_idempotent_upserts() {
        let store = InMemoryRecordStore::new();
        store.write_batch(&[entry("V1", 100)]).await.unwrap();
        store.write_batch(&[entry("V1", 100)]).await.unwrap();
        assert_eq!(store.len().await, 1);
    }
}
