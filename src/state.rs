use std::sync::Arc;

use crate::action_verifier::ActionVerifier;
use crate::auth::AuthService;
use crate::broadcaster::Broadcaster;
use crate::cache::CacheManager;
use crate::database::Database;
use crate::rate_limit::RateLimiter;
use crate::score_engine::ScoreEngine;

/// Shared application state threaded through every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub cache: Arc<CacheManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub verifier: Arc<ActionVerifier>,
    pub engine: Arc<ScoreEngine>,
    pub auth: Arc<AuthService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub top_k: i64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        cache: Arc<CacheManager>,
        broadcaster: Arc<Broadcaster>,
        verifier: Arc<ActionVerifier>,
        engine: Arc<ScoreEngine>,
        auth: Arc<AuthService>,
        rate_limiter: Arc<RateLimiter>,
        top_k: i64,
    ) -> Self {
        Self {
            db,
            cache,
            broadcaster,
            verifier,
            engine,
            auth,
            rate_limiter,
            top_k,
        }
    }
}
