use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth_middleware::AuthUser;
use crate::cache::CacheManager;
use crate::error::ScoreboardError;

/// A named rate-limit rule, e.g. `rl:auth:<addr>` at 5 requests / minute.
/// Distinct from the score-increment limiter in `action_verifier.rs`,
/// which checks its own `rl:score:<identity>` scope inline as part of
/// token verification; this module covers the scopes applied as HTTP
/// middleware ahead of a handler (`auth`, `admin`).
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub scope: &'static str,
    pub max_requests: u32,
    pub window: Duration,
    pub key_source: KeySource,
}

#[derive(Debug, Clone, Copy)]
pub enum KeySource {
    ClientIp,
    Identity,
}

impl RateLimitRule {
    pub const fn auth() -> Self {
        Self {
            scope: "auth",
            max_requests: 5,
            window: Duration::from_secs(60),
            key_source: KeySource::ClientIp,
        }
    }

    pub const fn admin() -> Self {
        Self {
            scope: "admin",
            max_requests: 30,
            window: Duration::from_secs(60),
            key_source: KeySource::Identity,
        }
    }
}

/// Shared per-scope counter, atop the same Redis-backed atomic
/// increment the cache uses for its other counters.
pub struct RateLimiter {
    cache: Arc<CacheManager>,
}

impl RateLimiter {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }

    pub async fn check(&self, scope: &str, key: &str, max_requests: u32, window: Duration) -> Result<(), ScoreboardError> {
        let redis_key = format!("rl:{scope}:{key}");
        let count = self.cache.incr_with_expiry(&redis_key, window).await;
        if count > i64::from(max_requests) {
            return Err(ScoreboardError::RateLimited {
                retry_after: window.as_secs(),
            });
        }
        Ok(())
    }
}

/// Builds an axum middleware closure bound to a fixed `RateLimitRule`,
/// for use with `middleware::from_fn_with_state` on a specific route.
pub async fn enforce(
    State((limiter, rule)): State<(Arc<RateLimiter>, RateLimitRule)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let key = match rule.key_source {
        KeySource::ClientIp => addr.ip().to_string(),
        KeySource::Identity => req
            .extensions()
            .get::<AuthUser>()
            .map(|u| u.user_id.clone())
            .unwrap_or_else(|| addr.ip().to_string()),
    };

    match limiter
        .check(rule.scope, &key, rule.max_requests, rule.window)
        .await
    {
        Ok(()) => next.run(req).await,
        Err(err) => err.into_response(),
    }
}
