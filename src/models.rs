use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An identity as provisioned by the registration collaborator.
///
/// `score` never decreases through the public API; `last_updated` is a
/// strictly increasing logical clock value (microseconds), not wall-clock
/// time, so ties can be broken deterministically even when two commits
/// land in the same millisecond.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScoreRecord {
    pub identity: String,
    pub score: i64,
    pub last_updated: i64,
}

/// Row persisted by the identity collaborator; owned by the Store only to
/// the extent needed to drive `/auth/register` and `/auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdentityRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Server-issued, single-use increment authorization. `mac` binds
/// `nonce`, `increment`, and `issued_at` under the server's action secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionToken {
    pub nonce: String,
    pub increment: i64,
    pub issued_at: i64,
    pub mac: String,
}

/// Append-only duplicate-suppression and audit row. `nonce` carries a
/// uniqueness constraint at the store layer; that constraint is the
/// authoritative source of `DUPLICATE_NONCE`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActionLogEntry {
    pub nonce: String,
    pub identity: String,
    pub increment: i64,
    pub issued_at: i64,
    pub accepted_at: i64,
    pub source_address: Option<String>,
}

/// A single row of the top-K ranking view, ordered by
/// `(score DESC, last_updated ASC)`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RankingEntry {
    pub rank: i64,
    pub identity: String,
    pub username: String,
    pub score: i64,
    pub last_updated: i64,
}

pub type Ranking = Vec<RankingEntry>;

#[derive(Debug, Clone, Serialize)]
pub struct UserRankView {
    pub identity: String,
    pub username: String,
    pub score: i64,
    pub rank: i64,
    pub total_users: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub identity: String,
    pub new_score: i64,
    pub rank: i64,
}
