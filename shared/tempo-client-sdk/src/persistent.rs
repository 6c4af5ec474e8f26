//! Persistent client cache - SQLite-backed, TTL- and size-bounded
//!
//! Survives process restarts so a returning client replays recent history
//! without touching the network. Capacity is enforced by least-recently-
//! accessed eviction down to 90% of the byte budget, so back-to-back writes
//! don't thrash the eviction path.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use tempo_core::{
    Clock, DataSource, EntityType, Result, TempoError, TimeRangeQuery, TimelineEntry,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS timeline_entries (
    entity_type      TEXT NOT NULL,
    entity_id        TEXT NOT NULL,
    timestamp        INTEGER NOT NULL,
    data             TEXT NOT NULL,
    source           TEXT NOT NULL,
    expires_at       INTEGER NOT NULL DEFAULT 0,
    approx_size_bytes INTEGER NOT NULL,
    stored_at        INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL,
    PRIMARY KEY (entity_type, entity_id, timestamp)
);
CREATE INDEX IF NOT EXISTS idx_entries_type_ts
    ON timeline_entries (entity_type, timestamp);
CREATE INDEX IF NOT EXISTS idx_entries_last_accessed
    ON timeline_entries (last_accessed_at);
"#;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PersistentStats {
    pub entries: u64,
    pub bytes: u64,
    pub max_bytes: u64,
}

pub struct PersistentCache {
    pool: SqlitePool,
    ttl_ms: i64,
    max_bytes: u64,
    clock: Arc<dyn Clock>,
}

fn storage_err(e: sqlx::Error) -> TempoError {
    TempoError::Storage(e.to_string())
}

impl PersistentCache {
    pub async fn open(
        path: impl AsRef<Path>,
        ttl_ms: i64,
        max_bytes: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(storage_err)?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(storage_err)?;

        Ok(Self {
            pool,
            ttl_ms,
            max_bytes,
            clock,
        })
    }

    /// Upsert a batch; an existing row is replaced wholesale and its access
    /// time refreshed. Runs eviction afterwards if the byte budget is blown.
    pub async fn put_batch(&self, entries: &[TimelineEntry]) -> Result<()> {
        let now = self.clock.now_ms();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for entry in entries {
            let data = serde_json::to_string(&entry.data)?;
            sqlx::query(
                "INSERT OR REPLACE INTO timeline_entries \
                 (entity_type, entity_id, timestamp, data, source, expires_at, \
                  approx_size_bytes, stored_at, last_accessed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(entry.entity_type.as_str())
            .bind(&entry.entity_id)
            .bind(entry.timestamp)
            .bind(data)
            .bind(entry.source.as_str())
            .bind(entry.expires_at)
            .bind(entry.approx_size_bytes as i64)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        self.evict_if_over_capacity().await
    }

    pub async fn query_range(&self, query: &TimeRangeQuery) -> Result<Vec<TimelineEntry>> {
        let now = self.clock.now_ms();
        let floor = now - self.ttl_ms;

        let mut sql = String::from(
            "SELECT entity_type, entity_id, timestamp, data, source, expires_at, \
             approx_size_bytes, last_accessed_at \
             FROM timeline_entries \
             WHERE entity_type = ? AND timestamp >= ? AND timestamp <= ? \
             AND stored_at > ? AND (expires_at = 0 OR expires_at > ?)",
        );
        if query.entity_id.is_some() {
            sql.push_str(" AND entity_id = ?");
        }
        sql.push_str(" ORDER BY timestamp ASC, entity_id ASC");
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql)
            .bind(query.entity_type.as_str())
            .bind(query.start_time)
            .bind(query.end_time)
            .bind(floor)
            .bind(now);
        if let Some(entity_id) = &query.entity_id {
            q = q.bind(entity_id);
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit as i64);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(storage_err)?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(self.row_to_entry(&row)?);
        }

        if !entries.is_empty() {
            self.touch(query, now).await?;
        }
        Ok(entries)
    }

    /// Refresh access time for everything a query returned, keeping the
    /// eviction order honest.
    async fn touch(&self, query: &TimeRangeQuery, now: i64) -> Result<()> {
        let mut sql = String::from(
            "UPDATE timeline_entries SET last_accessed_at = ? \
             WHERE entity_type = ? AND timestamp >= ? AND timestamp <= ?",
        );
        if query.entity_id.is_some() {
            sql.push_str(" AND entity_id = ?");
        }

        let mut q = sqlx::query(&sql)
            .bind(now)
            .bind(query.entity_type.as_str())
            .bind(query.start_time)
            .bind(query.end_time);
        if let Some(entity_id) = &query.entity_id {
            q = q.bind(entity_id);
        }
        q.execute(&self.pool).await.map_err(storage_err)?;
        Ok(())
    }

    fn row_to_entry(&self, row: &sqlx::sqlite::SqliteRow) -> Result<TimelineEntry> {
        let entity_type: String = row.try_get("entity_type").map_err(storage_err)?;
        let entity_id: String = row.try_get("entity_id").map_err(storage_err)?;
        let timestamp: i64 = row.try_get("timestamp").map_err(storage_err)?;
        let data: String = row.try_get("data").map_err(storage_err)?;
        let source: String = row.try_get("source").map_err(storage_err)?;
        let expires_at: i64 = row.try_get("expires_at").map_err(storage_err)?;
        let approx_size_bytes: i64 = row.try_get("approx_size_bytes").map_err(storage_err)?;
        let last_accessed_at: i64 = row.try_get("last_accessed_at").map_err(storage_err)?;

        Ok(TimelineEntry {
            entity_type: EntityType::parse(&entity_type),
            entity_id,
            timestamp,
            data: serde_json::from_str(&data)?,
            source: DataSource::parse(&source),
            expires_at,
            approx_size_bytes: approx_size_bytes as u64,
            last_accessed_at,
        })
    }

    /// Delete rows past the cache TTL or their own domain expiry.
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now_ms();
        let floor = now - self.ttl_ms;
        let result = sqlx::query(
            "DELETE FROM timeline_entries \
             WHERE stored_at <= ? OR (expires_at > 0 AND expires_at <= ?)",
        )
        .bind(floor)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    pub async fn invalidate(
        &self,
        entity_type: &EntityType,
        entity_id: Option<&str>,
    ) -> Result<u64> {
        let result = match entity_id {
            Some(id) => {
                sqlx::query(
                    "DELETE FROM timeline_entries WHERE entity_type = ? AND entity_id = ?",
                )
                .bind(entity_type.as_str())
                .bind(id)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query("DELETE FROM timeline_entries WHERE entity_type = ?")
                    .bind(entity_type.as_str())
                    .execute(&self.pool)
                    .await
            }
        }
        .map_err(storage_err)?;
        Ok(result.rows_affected())
    }

    async fn total_bytes(&self) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(approx_size_bytes), 0) AS bytes FROM timeline_entries",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        let bytes: i64 = row.try_get("bytes").map_err(storage_err)?;
        Ok(bytes as u64)
    }

    /// Least-recently-accessed eviction down to 90% of the byte budget.
    async fn evict_if_over_capacity(&self) -> Result<()> {
        let mut bytes = self.total_bytes().await?;
        if bytes <= self.max_bytes {
            return Ok(());
        }
        let target = self.max_bytes * 9 / 10;
        let mut evicted = 0u64;

        while bytes > target {
            let result = sqlx::query(
                "DELETE FROM timeline_entries WHERE rowid IN \
                 (SELECT rowid FROM timeline_entries ORDER BY last_accessed_at ASC LIMIT 256)",
            )
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
            if result.rows_affected() == 0 {
                break;
            }
            evicted += result.rows_affected();
            bytes = self.total_bytes().await?;
        }

        debug!(evicted, bytes, "Evicted persistent cache entries");
        Ok(())
    }

    pub async fn stats(&self) -> Result<PersistentStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS entries, COALESCE(SUM(approx_size_bytes), 0) AS bytes \
             FROM timeline_entries",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        let entries: i64 = row.try_get("entries").map_err(storage_err)?;
        let bytes: i64 = row.try_get("bytes").map_err(storage_err)?;
        Ok(PersistentStats {
            entries: entries as u64,
            bytes: bytes as u64,
            max_bytes: self.max_bytes,
        })
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM timeline_entries")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
