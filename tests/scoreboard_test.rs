use std::sync::Arc;
use std::time::Duration;

use scoreboard_backend::action_verifier::ActionVerifier;
use scoreboard_backend::broadcaster::Broadcaster;
use scoreboard_backend::cache::CacheManager;
use scoreboard_backend::database::{Database, PoolConfig};
use scoreboard_backend::error::ScoreboardError;
use scoreboard_backend::score_engine::ScoreEngine;

const TOP_K: i64 = 10;

async fn harness() -> (Arc<Database>, Arc<ActionVerifier>, Arc<ScoreEngine>) {
    let db = Arc::new(
        Database::connect("sqlite::memory:", PoolConfig::default())
            .await
            .unwrap(),
    );
    db.migrate().await.unwrap();

    // Point at an address nothing listens on so the cache degrades to
    // L1-only, same as the unit tests in cache.rs and action_verifier.rs.
    let cache = Arc::new(CacheManager::connect("redis://127.0.0.1:1").await);
    let verifier = Arc::new(ActionVerifier::new(
        "integration-test-secret".into(),
        1000,
        Duration::from_secs(300),
        cache.clone(),
    ));
    let broadcaster = Arc::new(Broadcaster::new());
    let engine = Arc::new(ScoreEngine::new(
        db.clone(),
        cache,
        verifier.clone(),
        broadcaster,
        TOP_K,
    ));

    (db, verifier, engine)
}

/// S1: a freshly issued token applies cleanly and the identity's rank
/// reflects the new score immediately.
#[tokio::test]
async fn s1_apply_increments_score_and_rank() {
    let (db, verifier, engine) = harness().await;
    db.create_identity("u1", "alice", "alice@example.com", "hash")
        .await
        .unwrap();

    let token = verifier.issue(50).unwrap();
    let outcome = engine.apply("u1", &token, None).await.unwrap();

    assert_eq!(outcome.new_score, 50);
    assert_eq!(outcome.rank, 1);
}

/// S2: replaying the same token a second time is rejected as a
/// duplicate action and does not double-apply the increment.
#[tokio::test]
async fn s2_replayed_token_is_rejected_as_duplicate() {
    let (db, verifier, engine) = harness().await;
    db.create_identity("u1", "alice", "alice@example.com", "hash")
        .await
        .unwrap();

    let token = verifier.issue(50).unwrap();
    engine.apply("u1", &token, None).await.unwrap();

    let err = engine.apply("u1", &token, None).await.unwrap_err();
    assert!(matches!(err, ScoreboardError::DuplicateAction));

    let score = db.get_score("u1").await.unwrap().unwrap();
    assert_eq!(score.score, 50);
}

/// S3: two identities reaching the same score rank by which one
/// committed first — the tie-break is `last_updated`, not identity.
#[tokio::test]
async fn s3_tied_scores_break_by_earlier_commit() {
    let (db, verifier, engine) = harness().await;
    db.create_identity("u1", "alice", "a@example.com", "hash")
        .await
        .unwrap();
    db.create_identity("u2", "bob", "b@example.com", "hash")
        .await
        .unwrap();

    let first = verifier.issue(100).unwrap();
    engine.apply("u1", &first, None).await.unwrap();
    let second = verifier.issue(100).unwrap();
    engine.apply("u2", &second, None).await.unwrap();

    let top = engine.top(TOP_K).await.unwrap();
    assert_eq!(top[0].identity, "u1");
    assert_eq!(top[1].identity, "u2");

    let bob_view = engine.user_rank("u2").await.unwrap();
    assert_eq!(bob_view.rank, 2);
}

/// S4: a token for an increment outside the configured bound is
/// rejected before it ever reaches the store.
#[tokio::test]
async fn s4_increment_out_of_bounds_is_rejected_at_issue() {
    let (_db, verifier, _engine) = harness().await;
    let err = verifier.issue(0).unwrap_err();
    assert!(matches!(err, ScoreboardError::InvalidScoreIncrement(_)));

    let err = verifier.issue(100_000).unwrap_err();
    assert!(matches!(err, ScoreboardError::InvalidScoreIncrement(_)));
}

/// S5: looking up a rank for an identity that was never created reports
/// USER_NOT_FOUND rather than a zero-score placeholder.
#[tokio::test]
async fn s5_unknown_identity_rank_lookup_is_not_found() {
    let (_db, _verifier, engine) = harness().await;
    let err = engine.user_rank("ghost").await.unwrap_err();
    assert!(matches!(err, ScoreboardError::UserNotFound(_)));
}

/// S6: applying an increment for an identity the token was never
/// associated with at issue time still succeeds — tokens aren't bound
/// to an identity, only the per-identity rate limit is.
#[tokio::test]
async fn s6_token_is_not_identity_bound() {
    let (db, verifier, engine) = harness().await;
    db.create_identity("u1", "alice", "a@example.com", "hash")
        .await
        .unwrap();
    db.create_identity("u2", "bob", "b@example.com", "hash")
        .await
        .unwrap();

    let token = verifier.issue(10).unwrap();
    // Token was minted without reference to either identity; either one
    // can redeem it so long as it is still novel.
    let outcome = engine.apply("u2", &token, None).await.unwrap();
    assert_eq!(outcome.identity, "u2");
}

/// Property: total_users never decreases as a side effect of applying
/// an increment to an existing identity.
#[tokio::test]
async fn property_apply_never_changes_identity_count() {
    let (db, verifier, engine) = harness().await;
    db.create_identity("u1", "alice", "a@example.com", "hash")
        .await
        .unwrap();

    let before = db.count_identities().await.unwrap();
    let token = verifier.issue(5).unwrap();
    engine.apply("u1", &token, None).await.unwrap();
    let after = db.count_identities().await.unwrap();

    assert_eq!(before, after);
}

/// Property: the top-K ranking returned by the engine is always sorted
/// by (score DESC, last_updated ASC).
#[tokio::test]
async fn property_top_k_is_sorted_by_score_then_recency() {
    let (db, verifier, engine) = harness().await;
    for (id, name, amount) in [("u1", "alice", 30), ("u2", "bob", 90), ("u3", "carol", 60)] {
        db.create_identity(id, name, &format!("{name}@example.com"), "hash")
            .await
            .unwrap();
        let token = verifier.issue(amount).unwrap();
        engine.apply(id, &token, None).await.unwrap();
    }

    let top = engine.top(TOP_K).await.unwrap();
    let scores: Vec<i64> = top.iter().map(|r| r.score).collect();
    let mut sorted = scores.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(scores, sorted);
    assert_eq!(top[0].identity, "u2");
}
