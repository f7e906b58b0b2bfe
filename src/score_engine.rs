use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::action_verifier::ActionVerifier;
use crate::broadcaster::Broadcaster;
use crate::cache::CacheManager;
use crate::database::Database;
use crate::error::ScoreboardError;
use crate::models::{ActionToken, ApplyOutcome, Ranking, ScoreRecord, UserRankView};

/// `top:K` is refreshed often enough that a stale L1 hit is never more
/// than about a second old; `score:<identity>` changes far less often
/// relative to how often it is read, so it can sit in L1 much longer.
const TOP_K_L1_TTL: Duration = Duration::from_secs(1);
const TOP_K_L2_TTL: Duration = Duration::from_secs(30);
const SCORE_L1_TTL: Duration = Duration::from_secs(60);
const SCORE_L2_TTL: Duration = Duration::from_secs(300);

fn top_key(k: i64) -> String {
    format!("top:{k}")
}

fn score_key(identity: &str) -> String {
    format!("score:{identity}")
}

/// Composes the Store, Cache, ActionVerifier, and Broadcaster into the
/// three operations the HTTP and WebSocket surfaces actually call.
///
/// `Clone` is cheap (every field is an `Arc` or `Copy`) and is relied on by
/// `apply`, which clones itself into a detached task so a cancelled HTTP
/// request can never roll back a commit that already succeeded.
#[derive(Clone)]
pub struct ScoreEngine {
    store: Arc<Database>,
    cache: Arc<CacheManager>,
    verifier: Arc<ActionVerifier>,
    broadcaster: Arc<Broadcaster>,
    default_top_k: i64,
}

impl ScoreEngine {
    pub fn new(
        store: Arc<Database>,
        cache: Arc<CacheManager>,
        verifier: Arc<ActionVerifier>,
        broadcaster: Arc<Broadcaster>,
        default_top_k: i64,
    ) -> Self {
        Self {
            store,
            cache,
            verifier,
            broadcaster,
            default_top_k,
        }
    }

    /// Verifies `token` for `identity`, applies the increment, and
    /// refreshes every downstream view before returning. A duplicate
    /// nonce is reported without touching any cache, since nothing about
    /// the scoreboard actually changed.
    ///
    /// Once the store transaction commits, everything else — marking the
    /// nonce consumed, cache invalidation, the top-K refill, and the
    /// broadcast — runs inside a detached `tokio::spawn` task. A client
    /// that disconnects mid-request cannot roll back a committed write,
    /// so the follow-up work must not be cancellable along with the
    /// request future that started it.
    pub async fn apply(
        &self,
        identity: &str,
        token: &ActionToken,
        source_address: Option<String>,
    ) -> Result<ApplyOutcome, ScoreboardError> {
        self.verifier.verify(identity, token).await?;

        let record = self
            .store
            .increment(
                identity,
                token.increment,
                &token.nonce,
                token.issued_at,
                source_address.as_deref(),
            )
            .await?;

        let engine = self.clone();
        let nonce = token.nonce.clone();
        let identity_owned = identity.to_string();
        let record_for_task = record.clone();
        let rank = tokio::spawn(async move {
            engine.verifier.mark_consumed(&nonce).await;
            engine.cache.invalidate(&score_key(&identity_owned)).await;
            engine.cache.invalidate(&top_key(engine.default_top_k)).await;

            let ranking = match engine.top(engine.default_top_k).await {
                Ok(ranking) => ranking,
                Err(e) => {
                    warn!("post-commit top-K refill failed, broadcasting best-effort: {e:?}");
                    Vec::new()
                }
            };
            let total_users = engine.store.count_identities().await.unwrap_or(0);
            let rank = match engine
                .store
                .count_ahead(record_for_task.score, record_for_task.last_updated)
                .await
            {
                Ok(ahead) => ahead + 1,
                Err(e) => {
                    warn!("post-commit rank computation failed: {e:?}");
                    -1
                }
            };

            engine
                .broadcaster
                .emit(ranking, total_users, record_for_task.last_updated);
            rank
        })
        .await
        .unwrap_or(-1);

        Ok(ApplyOutcome {
            identity: identity.to_string(),
            new_score: record.score,
            rank,
        })
    }

    /// Refreshes and re-broadcasts the top-K ranking without mutating any
    /// score. Used after identity registration — a new identity can't
    /// affect top-K unless `K` exceeds the current population, but
    /// subscribers still benefit from a refreshed `total_users`.
    pub async fn broadcast_current_ranking(&self) -> Result<(), ScoreboardError> {
        self.cache.invalidate(&top_key(self.default_top_k)).await;
        let ranking = self.top(self.default_top_k).await?;
        let total_users = self.store.count_identities().await?;
        self.broadcaster
            .emit(ranking, total_users, Utc::now().timestamp_micros());
        Ok(())
    }

    /// Top-K ranking, served from cache with a fresh load on miss. Only
    /// the configured default `K` is cached; a caller asking for any other
    /// size bypasses the cache entirely and reads the store directly, per
    /// spec.md §4.4 ("requests with k ≠ K bypass cache").
    pub async fn top(&self, k: i64) -> Result<Ranking, ScoreboardError> {
        if k != self.default_top_k {
            return Ok(self.store.get_top_k(k).await?);
        }

        let key = top_key(k);
        let store = self.store.clone();
        let ranking = self
            .cache
            .get_or_load(&key, TOP_K_L1_TTL, TOP_K_L2_TTL, move || {
                let store = store.clone();
                async move { Ok(store.get_top_k(k).await?) }
            })
            .await?;
        Ok(ranking)
    }

    /// Rank and score for a single identity, computed against the same
    /// `(score DESC, last_updated ASC)` ordering as `top`. The comparator
    /// is the identity's own `last_updated`, not "now" — two identities
    /// tied on score rank by whichever committed first, the same rule
    /// `top` applies.
    pub async fn user_rank(&self, identity: &str) -> Result<UserRankView, ScoreboardError> {
        let key = score_key(identity);
        let store = self.store.clone();
        let identity_owned = identity.to_string();
        // The loader carries the `Option` through the cache rather than
        // collapsing a missing identity into an error: that way a real
        // store/Redis failure (propagated via `?`) is distinguishable from
        // "the identity genuinely doesn't exist" once `get_or_load` returns,
        // instead of both surfacing as the same opaque `Err` and both being
        // reported to the caller as `UserNotFound`.
        let maybe_record: Option<ScoreRecord> = self
            .cache
            .get_or_load(&key, SCORE_L1_TTL, SCORE_L2_TTL, move || {
                let store = store.clone();
                let identity = identity_owned.clone();
                async move { Ok(store.get_score(&identity).await?) }
            })
            .await
            .map_err(|e| ScoreboardError::BackendUnavailable(e.to_string()))?;

        let record = maybe_record.ok_or_else(|| ScoreboardError::UserNotFound(identity.to_string()))?;

        let identity_record = self
            .store
            .get_identity(identity)
            .await?
            .ok_or_else(|| ScoreboardError::UserNotFound(identity.to_string()))?;
        let rank = self.store.count_ahead(record.score, record.last_updated).await? + 1;
        let total_users = self.store.count_identities().await?;

        Ok(UserRankView {
            identity: identity.to_string(),
            username: identity_record.username,
            score: record.score,
            rank,
            total_users,
        })
    }
}
