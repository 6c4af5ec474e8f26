//! Remote tier - HTTP client for the timeline service

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tempo_core::{EntityType, Result, TempoError, TierResult, TimeRangeQuery, TimelineEntry};

/// Final client-side tier. Unlike the local tiers its failures are not
/// silently absorbed: the caller decides whether local data is good enough.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn query_range(&self, query: &TimeRangeQuery) -> Result<TierResult>;

    async fn entry_at(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
        timestamp: i64,
    ) -> Result<Option<TimelineEntry>>;

    /// Push entries into the service's write path. Returns accepted count.
    async fn ingest(&self, entries: &[TimelineEntry]) -> Result<u64> {
        let _ = entries;
        Err(TempoError::Internal("ingest not supported".to_string()))
    }

    /// Server-side cache bust.
    async fn invalidate(
        &self,
        entity_type: &EntityType,
        entity_id: Option<&str>,
        before: Option<i64>,
    ) -> Result<serde_json::Value> {
        let _ = (entity_type, entity_id, before);
        Err(TempoError::Internal("invalidate not supported".to_string()))
    }

    /// Server tier statistics, loosely typed on the client side.
    async fn stats(&self) -> Result<serde_json::Value> {
        Err(TempoError::Internal("stats not supported".to_string()))
    }
}

/// Standard response envelope used by every tempo service.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IngestAccepted {
    accepted: u64,
}

#[derive(Debug, Serialize)]
struct InvalidateBody<'a> {
    entity_type: String,
    entity_id: Option<&'a str>,
    before: Option<i64>,
}

pub struct HttpRemoteApi {
    base_url: String,
    http: reqwest::Client,
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// A successful envelope may carry `data: null` (e.g. a point lookup
    /// before any entry exists), so absence is not an error here.
    async fn unwrap_envelope<T>(&self, response: reqwest::Response) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status().as_u16();
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| TempoError::Serialization(e.to_string()))?;

        if envelope.success {
            Ok(envelope.data)
        } else {
            let message = envelope.error.unwrap_or_else(|| "unknown error".to_string());
            Err(match status {
                400 => TempoError::InvalidQuery(message),
                503 => TempoError::DataUnavailable(message),
                504 => TempoError::Timeout(message),
                _ => TempoError::Network(message),
            })
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn query_range(&self, query: &TimeRangeQuery) -> Result<TierResult> {
        let mut params: Vec<(&str, String)> = vec![
            ("entity_type", query.entity_type.to_string()),
            ("start_time", query.start_time.to_string()),
            ("end_time", query.end_time.to_string()),
        ];
        if let Some(entity_id) = &query.entity_id {
            params.push(("entity_id", entity_id.clone()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }

        debug!(entity_type = %query.entity_type, "Remote range query");
        let response = self
            .http
            .get(format!("{}/v1/timeline/range", self.base_url))
            .query(&params)
            .send()
            .await
            .map_err(|e| TempoError::Network(e.to_string()))?;
        self.unwrap_envelope(response)
            .await?
            .ok_or_else(|| TempoError::Internal("range response missing body".to_string()))
    }

    async fn entry_at(
        &self,
        entity_type: &EntityType,
        entity_id: &str,
        timestamp: i64,
    ) -> Result<Option<TimelineEntry>> {
        let response = self
            .http
            .get(format!(
                "{}/v1/timeline/at/{}/{}/{}",
                self.base_url, entity_type, entity_id, timestamp
            ))
            .send()
            .await
            .map_err(|e| TempoError::Network(e.to_string()))?;
        self.unwrap_envelope(response).await
    }

    async fn ingest(&self, entries: &[TimelineEntry]) -> Result<u64> {
        let response = self
            .http
            .post(format!("{}/v1/ingest", self.base_url))
            .json(&serde_json::json!({ "entries": entries }))
            .send()
            .await
            .map_err(|e| TempoError::Network(e.to_string()))?;
        let accepted: Option<IngestAccepted> = self.unwrap_envelope(response).await?;
        Ok(accepted.map(|a| a.accepted).unwrap_or(0))
    }

    async fn invalidate(
        &self,
        entity_type: &EntityType,
        entity_id: Option<&str>,
        before: Option<i64>,
    ) -> Result<serde_json::Value> {
        let body = InvalidateBody {
            entity_type: entity_type.to_string(),
            entity_id,
            before,
        };
        let response = self
            .http
            .post(format!("{}/v1/cache/invalidate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| TempoError::Network(e.to_string()))?;
        let summary: Option<serde_json::Value> = self.unwrap_envelope(response).await?;
        Ok(summary.unwrap_or(serde_json::Value::Null))
    }

    async fn stats(&self) -> Result<serde_json::Value> {
        let response = self
            .http
            .get(format!("{}/v1/stats", self.base_url))
            .send()
            .await
            .map_err(|e| TempoError::Network(e.to_string()))?;
        let stats: Option<serde_json::Value> = self.unwrap_envelope(response).await?;
        Ok(stats.unwrap_or(serde_json::Value::Null))
    }
}
