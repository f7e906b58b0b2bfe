use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth_middleware::AuthUser;
use crate::error::ScoreboardError;
use crate::http_cache::cached_json_response;
use crate::models::{ActionToken, Ranking};
use crate::state::AppState;

/// GET /health - liveness/readiness probe. Reports the database and
/// cache (Redis-or-degraded) backends independently so an operator can
/// tell a dead pool apart from a merely-missing Redis, plus the live
/// subscriber count and L1 cache shape per spec.md §6.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.db.health_check().await;
    let cache_ok = state.cache.health_check().await;
    let stats = state.cache.get_stats();

    let status = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "success": db_ok,
            "data": {
                "status": if db_ok { "ok" } else { "degraded" },
                "subscribers": state.broadcaster.subscriber_count(),
                "cache": {
                    "status": if cache_ok { "ok" } else { "degraded" },
                    "hitRate": stats.hit_rate(),
                    "memoryUsage": state.cache.l1_memory_bytes(),
                },
            },
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct GenerateActionRequest {
    pub increment: i64,
}

/// POST /scoreboard/generate-action - mints a single-use token
/// authorizing `increment` points for the bearer-authenticated caller.
/// The token itself is not bound to an identity at the MAC level (only
/// `nonce`, `increment`, and `issued_at` are signed); the caller's
/// identity only scopes this call's own rate limit, the same scope
/// `update` checks again when the token is redeemed.
pub async fn generate_action(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<GenerateActionRequest>,
) -> Result<Json<serde_json::Value>, ScoreboardError> {
    let token = state.verifier.issue(request.increment)?;
    tracing::debug!(identity = %user.user_id, increment = request.increment, "issued action token");
    Ok(Json(json!({ "success": true, "data": token })))
}

/// POST /scoreboard/update - redeems a token and applies its increment
/// for the bearer-authenticated caller. The body carries the token
/// fields directly, matching what `generate-action` returned.
pub async fn update_score(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(token): Json<ActionToken>,
) -> Result<Json<serde_json::Value>, ScoreboardError> {
    let outcome = state
        .engine
        .apply(&user.user_id, &token, Some(addr.ip().to_string()))
        .await?;
    Ok(Json(json!({ "success": true, "data": outcome })))
}

#[derive(Debug, Deserialize)]
pub struct ScoreboardQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoreboardData {
    scoreboard: Ranking,
    total_users: i64,
    last_updated: i64,
}

#[derive(Serialize)]
struct ScoreboardResponseBody {
    success: bool,
    data: ScoreboardData,
}

/// GET /scoreboard - top-K ranking, conditionally cacheable via
/// ETag/Last-Modified. Wraps the ranking in the `{scoreboard, totalUsers,
/// lastUpdated}` shape spec.md §6 specifies, itself wrapped in the
/// `{success, data}` envelope shared by every endpoint.
pub async fn get_scoreboard(
    State(state): State<AppState>,
    Query(query): Query<ScoreboardQuery>,
    headers: HeaderMap,
) -> Result<axum::response::Response, ScoreboardError> {
    let k = query.limit.unwrap_or(state.top_k).clamp(1, state.top_k.max(1));
    let ranking = state.engine.top(k).await?;
    let total_users = state.db.count_identities().await?;
    let last_updated = ranking.iter().map(|entry| entry.last_updated).max().unwrap_or(0);

    let body = ScoreboardResponseBody {
        success: true,
        data: ScoreboardData {
            scoreboard: ranking,
            total_users,
            last_updated,
        },
    };

    cached_json_response(&headers, &format!("scoreboard:{k}"), &body, 5)
        .map_err(|e| ScoreboardError::Internal(e.to_string()))
}

/// GET /scoreboard/user/:identity - a single identity's score and rank.
pub async fn get_user_rank(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<serde_json::Value>, ScoreboardError> {
    let view = state.engine.user_rank(&identity).await?;
    Ok(Json(json!({ "success": true, "data": view })))
}
