//! HTTP and WebSocket API surface

pub mod rest;
pub mod websocket;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::service::TimelineService;

pub fn router(service: Arc<TimelineService>) -> Router {
    Router::new()
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::ready_check))
        .route("/v1/timeline/range", get(rest::query_range))
        .route(
            "/v1/timeline/entity/{entity_type}/{entity_id}",
            get(rest::entity_timeline),
        )
        .route(
            "/v1/timeline/at/{entity_type}/{entity_id}/{timestamp}",
            get(rest::entry_at),
        )
        .route("/v1/timeline/batch", post(rest::batch_query))
        .route("/v1/ingest", post(rest::ingest))
        .route("/v1/cache/invalidate", post(rest::invalidate))
        .route("/v1/stats", get(rest::stats))
        .route("/v1/live", get(websocket::ws_handler))
        .with_state(service)
}
