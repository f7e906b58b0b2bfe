use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use std::sync::Arc;
use tracing::warn;

use crate::auth::{AuthService, LoginRequest, RegisterRequest};
use crate::error::ScoreboardError;
use crate::score_engine::ScoreEngine;

/// Shared state for the `/auth/*` routes. Registration needs the
/// `ScoreEngine` (not just `AuthService`) so it can re-broadcast the
/// ranking snapshot after provisioning a new zero-score identity.
#[derive(Clone)]
pub struct AuthApiState {
    pub auth: Arc<AuthService>,
    pub engine: Arc<ScoreEngine>,
}

/// POST /auth/register. Provisions the identity, then re-broadcasts the
/// current ranking snapshot: a score-0 identity can't enter top-K unless
/// `K` exceeds the current population, but subscribers still benefit from
/// a refreshed `total_users` (spec.md §9, preserved by design).
pub async fn register(
    State(state): State<AuthApiState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ScoreboardError> {
    if request.username.trim().is_empty() || request.email.trim().is_empty() || request.password.is_empty() {
        return Err(ScoreboardError::MissingFields(
            "username, email, and password are required".into(),
        ));
    }

    let response = state.auth.register(request).await?;

    if let Err(e) = state.engine.broadcast_current_ranking().await {
        warn!("post-registration broadcast failed: {e:?}");
    }

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "data": response })),
    ))
}

/// POST /auth/login
pub async fn login(
    State(state): State<AuthApiState>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, ScoreboardError> {
    let response = state.auth.login(request).await?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "success": true, "data": response })),
    ))
}

pub fn routes(state: AuthApiState) -> Router {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .with_state(state)
}
