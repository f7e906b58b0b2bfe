use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scoreboard_backend::action_verifier::ActionVerifier;
use scoreboard_backend::api::{auth as auth_api, cache_stats};
use scoreboard_backend::auth::AuthService;
use scoreboard_backend::auth_middleware::auth_middleware;
use scoreboard_backend::broadcaster::Broadcaster;
use scoreboard_backend::cache::CacheManager;
use scoreboard_backend::database::{Database, PoolConfig};
use scoreboard_backend::env_config;
use scoreboard_backend::handlers;
use scoreboard_backend::rate_limit::{self, RateLimitRule, RateLimiter};
use scoreboard_backend::request_id::request_id_middleware;
use scoreboard_backend::score_engine::ScoreEngine;
use scoreboard_backend::state::AppState;
use scoreboard_backend::websocket::ws_handler;

fn env_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Builds the CORS layer from `CORS_ALLOWED_ORIGINS` (comma-separated, or
/// `*` for any origin). Mirrored in `tests/cors_test.rs` against a
/// standalone router so the matching logic is exercised without booting
/// the full service.
fn cors_layer_from_origins(cors_allowed_origins: &str) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
        Method::PATCH,
        Method::HEAD,
    ];

    let base = CorsLayer::new()
        .allow_methods(methods)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600));

    if cors_allowed_origins.trim() == "*" {
        return base.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = cors_allowed_origins
        .split(',')
        .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
        .collect();

    if origins.is_empty() {
        base.allow_origin(Any)
    } else {
        base.allow_origin(origins)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scoreboard_backend=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    env_config::validate_env()?;
    env_config::log_env_config();

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://scoreboard.db".to_string());
    tracing::info!("connecting to database");
    let db = Arc::new(Database::connect(&database_url, PoolConfig::from_env()).await?);
    tracing::info!("running database migrations");
    db.migrate().await?;

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let cache = Arc::new(CacheManager::connect(&redis_url).await);

    let action_secret = std::env::var("ACTION_SECRET").expect("ACTION_SECRET validated by env_config");
    let jwt_secret = std::env::var("JWT_SECRET").expect("JWT_SECRET validated by env_config");
    let max_increment: i64 = env_var("MAX_SCORE_INCREMENT", 1000);
    let freshness_seconds: u64 = env_var("ACTION_FRESHNESS_SECONDS", 300);
    let top_k: i64 = env_var("TOP_K", 10);

    let verifier = Arc::new(ActionVerifier::new(
        action_secret,
        max_increment,
        Duration::from_secs(freshness_seconds),
        cache.clone(),
    ));
    let broadcaster = Arc::new(Broadcaster::new());
    let engine = Arc::new(ScoreEngine::new(
        db.clone(),
        cache.clone(),
        verifier.clone(),
        broadcaster.clone(),
        top_k,
    ));
    let auth = Arc::new(AuthService::new(jwt_secret, db.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(cache.clone()));

    let state = AppState::new(
        db.clone(),
        cache.clone(),
        broadcaster.clone(),
        verifier,
        engine.clone(),
        auth.clone(),
        rate_limiter.clone(),
        top_k,
    );

    let auth_rate_limit = (rate_limiter.clone(), RateLimitRule::auth());
    let admin_rate_limit = (rate_limiter.clone(), RateLimitRule::admin());

    let auth_api_state = auth_api::AuthApiState {
        auth: auth.clone(),
        engine: engine.clone(),
    };
    let auth_routes = auth_api::routes(auth_api_state)
        .layer(middleware::from_fn_with_state(auth_rate_limit, rate_limit::enforce));

    let cache_admin_state = cache_stats::CacheAdminState {
        cache: cache.clone(),
        engine: engine.clone(),
        top_k,
    };
    // `auth_middleware` must run before `rate_limit::enforce` so the
    // admin scope (keyed by identity) sees `AuthUser` in the request
    // extensions; the last `.layer()` call is the outermost and runs
    // first, so auth is layered on after rate limiting here.
    let cache_routes = cache_stats::routes(cache_admin_state)
        .layer(middleware::from_fn_with_state(admin_rate_limit, rate_limit::enforce))
        .layer(middleware::from_fn_with_state(auth.clone(), auth_middleware));

    // `/scoreboard` and `/health` are public reads; generating/redeeming
    // an action token and looking up a per-identity rank require a
    // bearer credential, per spec.md §6's endpoint table.
    let public_scoreboard_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/scoreboard", get(handlers::get_scoreboard))
        .with_state(state.clone());

    let protected_scoreboard_routes = Router::new()
        .route("/scoreboard/generate-action", post(handlers::generate_action))
        .route("/scoreboard/update", post(handlers::update_score))
        .route("/scoreboard/user/:identity", get(handlers::get_user_rank))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(auth.clone(), auth_middleware));

    let ws_routes = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(broadcaster);

    let cors = cors_layer_from_origins(&std::env::var("CORS_ALLOWED_ORIGINS").unwrap_or_else(|_| "*".to_string()));

    let app = Router::new()
        .merge(public_scoreboard_routes)
        .merge(protected_scoreboard_routes)
        .merge(auth_routes)
        .merge(cache_routes)
        .merge(ws_routes)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CompressionLayer::new())
        .layer(cors);

    let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("SERVER_PORT").unwrap_or_else(|_| "8080".to_string());
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    tracing::info!("server starting on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
