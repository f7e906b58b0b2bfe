use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

/// Closed error set shared across the admission, ranking, and broadcast
/// paths (spec §7). Unlike the teacher's per-module `ApiError` /
/// `AuthError` / `SigningError` split, the scoreboard's error table is
/// already one flat set shared by every handler, so one enum covers it.
#[derive(Debug)]
pub enum ScoreboardError {
    MissingFields(String),
    InvalidScoreIncrement(String),
    InvalidActionHash(String),
    InvalidToken(String),
    DuplicateAction,
    DuplicateIdentity(String),
    RateLimited { retry_after: u64 },
    UserNotFound(String),
    BackendUnavailable(String),
    Internal(String),
}

impl ScoreboardError {
    fn code(&self) -> &'static str {
        match self {
            Self::MissingFields(_) => "MISSING_FIELDS",
            Self::InvalidScoreIncrement(_) => "INVALID_SCORE_INCREMENT",
            Self::InvalidActionHash(_) => "INVALID_ACTION_HASH",
            Self::InvalidToken(_) => "INVALID_TOKEN",
            Self::DuplicateAction => "DUPLICATE_ACTION",
            Self::DuplicateIdentity(_) => "DUPLICATE_IDENTITY",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::UserNotFound(_) => "USER_NOT_FOUND",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::MissingFields(_) | Self::InvalidScoreIncrement(_) => StatusCode::BAD_REQUEST,
            Self::InvalidActionHash(_) | Self::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            Self::DuplicateAction | Self::DuplicateIdentity(_) => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UserNotFound(_) => StatusCode::NOT_FOUND,
            Self::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::MissingFields(m)
            | Self::InvalidScoreIncrement(m)
            | Self::InvalidActionHash(m)
            | Self::InvalidToken(m)
            | Self::UserNotFound(m)
            | Self::DuplicateIdentity(m)
            | Self::BackendUnavailable(m)
            | Self::Internal(m) => m.clone(),
            Self::DuplicateAction => "action nonce already consumed".to_string(),
            Self::RateLimited { retry_after } => {
                format!("rate limit exceeded, retry after {retry_after}s")
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ScoreboardError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = match &self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let body = json!({
            "success": false,
            "error": ErrorBody {
                code: self.code(),
                message: self.message(),
            },
        });

        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<sqlx::Error> for ScoreboardError {
    fn from(err: sqlx::Error) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

impl From<anyhow::Error> for ScoreboardError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
