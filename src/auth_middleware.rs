use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::auth::AuthService;

/// Identity attached to request extensions once a bearer token validates.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
}

/// Validates the `Authorization: Bearer <token>` header against the
/// shared `AuthService` and attaches the resolved `AuthUser` to the
/// request's extensions for downstream handlers and the identity-scoped
/// rate limiter.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthService>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(AuthError::MissingToken)?;

    let token = header_value
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidToken)?;

    let claims = auth.validate_token(token).map_err(|_| AuthError::InvalidToken)?;

    req.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        username: claims.username,
    });

    Ok(next.run(req).await)
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            Self::MissingToken => "missing authentication token",
            Self::InvalidToken => "invalid or expired token",
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": { "code": "INVALID_TOKEN", "message": message } })),
        )
            .into_response()
    }
}
