use axum::{
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::cache::{CacheManager, CacheStats};
use crate::error::ScoreboardError;
use crate::score_engine::ScoreEngine;

#[derive(Serialize)]
pub struct CacheStatsResponse {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub hit_rate_percent: f64,
    pub total_requests: u64,
}

impl From<CacheStats> for CacheStatsResponse {
    fn from(stats: CacheStats) -> Self {
        let total_requests = stats.hits + stats.misses;
        Self {
            hits: stats.hits,
            misses: stats.misses,
            invalidations: stats.invalidations,
            hit_rate_percent: stats.hit_rate(),
            total_requests,
        }
    }
}

#[derive(Clone)]
pub struct CacheAdminState {
    pub cache: Arc<CacheManager>,
    pub engine: Arc<ScoreEngine>,
    pub top_k: i64,
}

/// GET /cache/stats
pub async fn get_cache_stats(State(state): State<CacheAdminState>, headers: HeaderMap) -> Response {
    let response = CacheStatsResponse::from(state.cache.get_stats());

    match crate::http_cache::cached_json_response(&headers, "cache:stats", &response, 30) {
        Ok(resp) => resp,
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "success": false, "error": { "code": "INTERNAL", "message": e.to_string() } })),
        )
            .into_response(),
    }
}

/// POST /cache/warm - forces the top-K ranking back into cache ahead of
/// the next read, e.g. after a planned Redis restart.
pub async fn warm_cache(State(state): State<CacheAdminState>) -> Result<Json<serde_json::Value>, ScoreboardError> {
    state.cache.invalidate(&format!("top:{}", state.top_k)).await;
    let ranking = state.engine.top(state.top_k).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": { "warmed_entries": ranking.len() },
    })))
}

/// POST /cache/clear - drops the local L1 tier. L2 entries are left to
/// expire on their own TTL; see `CacheManager::clear_l1` for why.
pub async fn clear_cache(State(state): State<CacheAdminState>) -> Json<serde_json::Value> {
    state.cache.clear_l1();
    state.cache.reset_stats();
    Json(serde_json::json!({ "success": true, "data": { "cleared": true } }))
}

pub fn routes(state: CacheAdminState) -> Router {
    Router::new()
        .route("/cache/stats", get(get_cache_stats))
        .route("/cache/warm", post(warm_cache))
        .route("/cache/clear", delete(clear_cache))
        .with_state(state)
}
