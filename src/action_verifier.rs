use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::cache::CacheManager;
use crate::error::ScoreboardError;
use crate::models::ActionToken;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_RATE_LIMIT_MAX: u32 = 10;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;
/// Grace period added on top of `freshness_seconds` before a consumed
/// nonce marker is allowed to expire, so a retried request arriving right
/// at the freshness boundary still finds the marker.
const NONCE_MARKER_GRACE_SECONDS: u64 = 30;

fn nonce_marker_key(nonce: &str) -> String {
    format!("nonce:seen:{nonce}")
}

/// Issues and verifies single-use action tokens that authorize a score
/// increment. The MAC scheme mirrors the teacher's request-signing
/// middleware (HMAC-SHA256 over a fixed field order, constant-time
/// compare), generalized from signing a whole request to signing the
/// `(nonce, increment, issued_at)` triple carried by an `ActionToken`.
pub struct ActionVerifier {
    secret: Vec<u8>,
    max_increment: i64,
    freshness: Duration,
    rate_limit_max: u32,
    rate_limit_window: Duration,
    cache: Arc<CacheManager>,
}

impl ActionVerifier {
    pub fn new(secret: String, max_increment: i64, freshness: Duration, cache: Arc<CacheManager>) -> Self {
        Self {
            secret: secret.into_bytes(),
            max_increment,
            freshness,
            rate_limit_max: DEFAULT_RATE_LIMIT_MAX,
            rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
            cache,
        }
    }

    pub fn with_rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.rate_limit_max = max_requests;
        self.rate_limit_window = window;
        self
    }

    fn mac(&self, nonce: &str, increment: i64, issued_at: i64) -> Result<HmacSha256, ScoreboardError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ScoreboardError::Internal(format!("invalid action secret: {e}")))?;
        mac.update(nonce.as_bytes());
        mac.update(b".");
        mac.update(increment.to_be_bytes().as_slice());
        mac.update(b".");
        mac.update(issued_at.to_be_bytes().as_slice());
        Ok(mac)
    }

    /// Mints a fresh token. Issuance is stateless: nothing is written
    /// until the caller later presents the token to `verify` and the
    /// increment is actually applied.
    pub fn issue(&self, increment: i64) -> Result<ActionToken, ScoreboardError> {
        if increment < 1 || increment > self.max_increment {
            return Err(ScoreboardError::InvalidScoreIncrement(format!(
                "increment must be between 1 and {}",
                self.max_increment
            )));
        }

        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let issued_at = Utc::now().timestamp();
        let mac = self.mac(&nonce, increment, issued_at)?.finalize().into_bytes();

        Ok(ActionToken {
            nonce,
            increment,
            issued_at,
            mac: hex::encode(mac),
        })
    }

    /// Validates a presented token in the fixed order: shape, MAC,
    /// freshness window, rate limit, then the nonce-novelty fast path.
    /// Each step short-circuits on the first failure so a request that
    /// fails an early, cheap check never pays for a later, more
    /// expensive one.
    pub async fn verify(&self, identity: &str, token: &ActionToken) -> Result<(), ScoreboardError> {
        if token.nonce.is_empty() || token.mac.is_empty() {
            return Err(ScoreboardError::MissingFields(
                "action token is missing nonce or mac".into(),
            ));
        }
        if token.increment < 1 || token.increment > self.max_increment {
            return Err(ScoreboardError::InvalidScoreIncrement(format!(
                "increment must be between 1 and {}",
                self.max_increment
            )));
        }

        let provided = hex::decode(&token.mac)
            .map_err(|_| ScoreboardError::InvalidActionHash("malformed mac encoding".into()))?;
        self.mac(&token.nonce, token.increment, token.issued_at)?
            .verify_slice(&provided)
            .map_err(|_| ScoreboardError::InvalidActionHash("mac does not match token fields".into()))?;

        let now = Utc::now().timestamp();
        let age = now - token.issued_at;
        if age < 0 || age as u64 > self.freshness.as_secs() {
            return Err(ScoreboardError::InvalidActionHash("action token expired".into()));
        }

        self.check_rate_limit(identity).await?;

        if self.cache.has_marker(&nonce_marker_key(&token.nonce)).await {
            return Err(ScoreboardError::DuplicateAction);
        }

        Ok(())
    }

    async fn check_rate_limit(&self, identity: &str) -> Result<(), ScoreboardError> {
        let key = format!("rl:score:{identity}");
        let count = self.cache.incr_with_expiry(&key, self.rate_limit_window).await;
        if count > i64::from(self.rate_limit_max) {
            return Err(ScoreboardError::RateLimited {
                retry_after: self.rate_limit_window.as_secs(),
            });
        }
        Ok(())
    }

    /// Records that `nonce` has been consumed, ahead of the Store's
    /// authoritative unique-constraint check. Marker outlives the
    /// freshness window by a grace period so late duplicates of an
    /// already-rejected-as-expired token still hit the fast path.
    pub async fn mark_consumed(&self, nonce: &str) {
        let ttl = self.freshness + Duration::from_secs(NONCE_MARKER_GRACE_SECONDS);
        self.cache.set_marker(&nonce_marker_key(nonce), ttl).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn verifier() -> ActionVerifier {
        let cache = Arc::new(CacheManager::connect("redis://127.0.0.1:1").await);
        ActionVerifier::new("test-secret".into(), 1000, Duration::from_secs(300), cache)
    }

    #[tokio::test]
    async fn issued_token_verifies() {
        let verifier = verifier().await;
        let token = verifier.issue(10).unwrap();
        verifier.verify("alice", &token).await.unwrap();
    }

    #[tokio::test]
    async fn tampered_increment_fails_mac() {
        let verifier = verifier().await;
        let mut token = verifier.issue(10).unwrap();
        token.increment = 999;
        let err = verifier.verify("alice", &token).await.unwrap_err();
        assert!(matches!(err, ScoreboardError::InvalidActionHash(_)));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let verifier = ActionVerifier::new(
            "test-secret".into(),
            1000,
            Duration::from_secs(0),
            Arc::new(CacheManager::connect("redis://127.0.0.1:1").await),
        );
        let token = verifier.issue(10).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let err = verifier.verify("alice", &token).await.unwrap_err();
        assert!(matches!(err, ScoreboardError::InvalidActionHash(_)));
    }

    #[tokio::test]
    async fn consumed_marker_is_detected_as_duplicate() {
        let verifier = verifier().await;
        let token = verifier.issue(10).unwrap();
        verifier.mark_consumed(&token.nonce).await;
        let err = verifier.verify("alice", &token).await.unwrap_err();
        assert!(matches!(err, ScoreboardError::DuplicateAction));
    }

    #[tokio::test]
    async fn rate_limit_trips_after_max_requests() {
        let verifier = verifier().await.with_rate_limit(2, Duration::from_secs(60));
        for _ in 0..2 {
            let token = verifier.issue(1).unwrap();
            verifier.verify("bob", &token).await.unwrap();
        }
        let token = verifier.issue(1).unwrap();
        let err = verifier.verify("bob", &token).await.unwrap_err();
        assert!(matches!(err, ScoreboardError::RateLimited { .. }));
    }
}
