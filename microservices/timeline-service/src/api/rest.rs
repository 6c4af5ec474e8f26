//! REST API handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use tempo_core::{
    DataSource, EntityType, TempoError, TierResult, TimeRangeQuery, TimelineEntry,
};

use crate::service::{InvalidationSummary, TierStatsSnapshot, TimelineService};

/// Generic API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }

    pub fn error(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(message.into()),
        })
    }
}

/// Maps domain errors onto HTTP responses with the standard envelope.
pub struct ApiError(TempoError);

impl From<TempoError> for ApiError {
    fn from(err: TempoError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ApiResponse::<serde_json::Value>::error(self.0.to_string());
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn ready_check(State(service): State<Arc<TimelineService>>) -> Response {
    let stats = service.stats().await;
    if stats.record_healthy {
        "OK".into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "system of record unreachable").into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub entity_type: String,
    pub start_time: i64,
    pub end_time: i64,
    pub entity_id: Option<String>,
    pub limit: Option<usize>,
}

impl RangeParams {
    fn into_query(self) -> TimeRangeQuery {
        let mut query = TimeRangeQuery::range(
            EntityType::parse(&self.entity_type),
            self.start_time,
            self.end_time,
        );
        if let Some(entity_id) = self.entity_id {
            query = query.for_entity(entity_id);
        }
        if let Some(limit) = self.limit {
            query = query.with_limit(limit);
        }
        query
    }
}

pub async fn query_range(
    State(service): State<Arc<TimelineService>>,
    Query(params): Query<RangeParams>,
) -> ApiResult<TierResult> {
    let result = service.query_range(&params.into_query()).await?;
    Ok(ApiResponse::success(result))
}

pub async fn entity_timeline(
    State(service): State<Arc<TimelineService>>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> ApiResult<TierResult> {
    let result = service
        .entity(EntityType::parse(&entity_type), &entity_id)
        .await?;
    Ok(ApiResponse::success(result))
}

pub async fn entry_at(
    State(service): State<Arc<TimelineService>>,
    Path((entity_type, entity_id, timestamp)): Path<(String, String, i64)>,
) -> ApiResult<Option<TimelineEntry>> {
    let entry = service
        .at(EntityType::parse(&entity_type), &entity_id, timestamp)
        .await?;
    Ok(ApiResponse::success(entry))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub queries: Vec<RangeParams>,
}

#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub success: bool,
    pub result: Option<TierResult>,
    pub error: Option<String>,
}

pub async fn batch_query(
    State(service): State<Arc<TimelineService>>,
    Json(req): Json<BatchRequest>,
) -> ApiResult<Vec<BatchItem>> {
    let queries: Vec<TimeRangeQuery> = req.queries.into_iter().map(RangeParams::into_query).collect();
    let items = service
        .batch(&queries)
        .await
        .into_iter()
        .map(|result| match result {
            Ok(r) => BatchItem {
                success: true,
                result: Some(r),
                error: None,
            },
            Err(e) => BatchItem {
                success: false,
                result: None,
                error: Some(e.to_string()),
            },
        })
        .collect();
    Ok(ApiResponse::success(items))
}

#[derive(Debug, Deserialize)]
pub struct IngestEntry {
    pub entity_type: String,
    pub entity_id: String,
    pub timestamp: i64,
    pub data: serde_json::Value,
    #[serde(default)]
    pub source: Option<DataSource>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Accepts `{"entries": [...]}`, a bare array, or a single entry object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum IngestRequest {
    Wrapped { entries: Vec<IngestEntry> },
    Many(Vec<IngestEntry>),
    Single(IngestEntry),
}

impl IngestRequest {
    fn into_entries(self) -> Vec<IngestEntry> {
        match self {
            Self::Wrapped { entries } => entries,
            Self::Many(entries) => entries,
            Self::Single(entry) => vec![entry],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
}

pub async fn ingest(
    State(service): State<Arc<TimelineService>>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<IngestResponse> {
    let entries: Vec<TimelineEntry> = req
        .into_entries()
        .into_iter()
        .map(|e| {
            let mut entry = TimelineEntry::new(
                EntityType::parse(&e.entity_type),
                e.entity_id,
                e.timestamp,
                e.data,
            );
            if let Some(source) = e.source {
                entry.source = source;
            }
            if let Some(expires_at) = e.expires_at {
                entry.expires_at = expires_at;
            }
            entry
        })
        .collect();

    let accepted = service.ingest(entries).await?;
    Ok(ApiResponse::success(IngestResponse { accepted }))
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub before: Option<i64>,
}

pub async fn invalidate(
    State(service): State<Arc<TimelineService>>,
    Json(req): Json<InvalidateRequest>,
) -> ApiResult<InvalidationSummary> {
    let summary = service
        .invalidate(
            &EntityType::parse(&req.entity_type),
            req.entity_id.as_deref(),
            req.before,
        )
        .await?;
    Ok(ApiResponse::success(summary))
}

pub async fn stats(State(service): State<Arc<TimelineService>>) -> ApiResult<TierStatsSnapshot> {
    Ok(ApiResponse::success(service.stats().await))
}
