use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::models::{ActionLogEntry, IdentityRecord, RankingEntry, ScoreRecord};

/// Pool tuning, read from the environment the same way the rest of the
/// service reads its config (see `env_config.rs`).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub max_lifetime_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout_seconds: 5,
            idle_timeout_seconds: 300,
            max_lifetime_seconds: 1800,
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_connections: env_var("DB_POOL_MAX_CONNECTIONS", default.max_connections),
            min_connections: env_var("DB_POOL_MIN_CONNECTIONS", default.min_connections),
            connect_timeout_seconds: env_var(
                "DB_POOL_CONNECT_TIMEOUT_SECONDS",
                default.connect_timeout_seconds,
            ),
            idle_timeout_seconds: env_var(
                "DB_POOL_IDLE_TIMEOUT_SECONDS",
                default.idle_timeout_seconds,
            ),
            max_lifetime_seconds: env_var("DB_POOL_MAX_LIFETIME_SECONDS", default.max_lifetime_seconds),
        }
    }
}

fn env_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug)]
pub enum StoreError {
    DuplicateNonce,
    DuplicateIdentity,
    UnknownIdentity,
    Db(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateNonce => write!(f, "nonce already consumed"),
            Self::DuplicateIdentity => write!(f, "username or email already registered"),
            Self::UnknownIdentity => write!(f, "unknown identity"),
            Self::Db(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for crate::error::ScoreboardError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateNonce => Self::DuplicateAction,
            StoreError::DuplicateIdentity => {
                Self::DuplicateIdentity("username or email already registered".into())
            }
            StoreError::UnknownIdentity => Self::UserNotFound("unknown identity".into()),
            StoreError::Db(e) => Self::BackendUnavailable(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return Self::DuplicateNonce;
            }
        }
        Self::Db(err)
    }
}

/// Persistence tier. `increment` is the only write path and runs inside a
/// single transaction so the action-log insert (whose `nonce` column is
/// unique) and the score update commit atomically. `clock` is a hybrid
/// logical clock: SQLite timestamps only carry second resolution, so two
/// increments landing in the same wall-clock second would otherwise tie
/// with no deterministic order.
pub struct Database {
    pool: SqlitePool,
    clock: AtomicI64,
}

impl Database {
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(config.max_lifetime_seconds))
            .connect(database_url)
            .await?;

        Ok(Self {
            pool,
            clock: AtomicI64::new(Utc::now().timestamp_micros()),
        })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Monotonic microsecond tick, strictly greater than every tick handed
    /// out before it, even across concurrent callers.
    fn next_tick(&self) -> i64 {
        loop {
            let prev = self.clock.load(Ordering::SeqCst);
            let wall = Utc::now().timestamp_micros();
            let next = wall.max(prev + 1);
            if self
                .clock
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    pub async fn create_identity(
        &self,
        id: &str,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<IdentityRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        // The `identities` table carries its own UNIQUE constraints on
        // `username` and `email`; a conflict here means a duplicate
        // registration, not a duplicate action nonce, so this insert is
        // mapped by hand instead of through the generic `sqlx::Error`
        // conversion `increment` below relies on.
        let record = sqlx::query_as::<_, IdentityRecord>(
            r#"
            INSERT INTO identities (id, username, email, password_hash)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING id, username, email, password_hash, created_at
            "#,
        )
        .bind(id)
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::DuplicateIdentity,
            _ => StoreError::Db(e),
        })?;

        sqlx::query(
            r#"
            INSERT INTO score_records (identity, score, last_updated)
            VALUES (?1, 0, ?2)
            "#,
        )
        .bind(id)
        .bind(self.next_tick())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    pub async fn get_identity(&self, id: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let record = sqlx::query_as::<_, IdentityRecord>(
            "SELECT id, username, email, password_hash, created_at FROM identities WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let record = sqlx::query_as::<_, IdentityRecord>(
            "SELECT id, username, email, password_hash, created_at FROM identities WHERE username = ?1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn get_identity_by_email(
        &self,
        email: &str,
    ) -> Result<Option<IdentityRecord>, StoreError> {
        let record = sqlx::query_as::<_, IdentityRecord>(
            "SELECT id, username, email, password_hash, created_at FROM identities WHERE email = ?1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Applies a verified increment. The `nonce` unique constraint is the
    /// sole source of truth for duplicate suppression; a conflicting
    /// insert aborts the transaction before the score is ever touched.
    pub async fn increment(
        &self,
        identity: &str,
        amount: i64,
        nonce: &str,
        issued_at: i64,
        source_address: Option<&str>,
    ) -> Result<ScoreRecord, StoreError> {
        let mut tx = self.pool.begin().await?;
        let accepted_at = self.next_tick();

        if self.get_identity(identity).await?.is_none() {
            return Err(StoreError::UnknownIdentity);
        }

        sqlx::query(
            r#"
            INSERT INTO action_log (nonce, identity, increment, issued_at, accepted_at, source_address)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(nonce)
        .bind(identity)
        .bind(amount)
        .bind(issued_at)
        .bind(accepted_at)
        .bind(source_address)
        .execute(&mut *tx)
        .await?;

        let record = sqlx::query_as::<_, ScoreRecord>(
            r#"
            UPDATE score_records
            SET score = score + ?1, last_updated = ?2
            WHERE identity = ?3
            RETURNING identity, score, last_updated
            "#,
        )
        .bind(amount)
        .bind(accepted_at)
        .bind(identity)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(record)
    }

    pub async fn has_nonce(&self, nonce: &str) -> Result<bool, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT nonce FROM action_log WHERE nonce = ?1")
                .bind(nonce)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn get_score(&self, identity: &str) -> Result<Option<ScoreRecord>, StoreError> {
        let record = sqlx::query_as::<_, ScoreRecord>(
            "SELECT identity, score, last_updated FROM score_records WHERE identity = ?1",
        )
        .bind(identity)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Top-K ranking, ordered `(score DESC, last_updated ASC)` per the
    /// tie-break rule: the identity whose increment landed first wins ties.
    pub async fn get_top_k(&self, k: i64) -> Result<Vec<RankingEntry>, StoreError> {
        let rows = sqlx::query_as::<_, RankingEntry>(
            r#"
            SELECT
                ROW_NUMBER() OVER (ORDER BY s.score DESC, s.last_updated ASC) AS rank,
                s.identity AS identity,
                i.username AS username,
                s.score AS score,
                s.last_updated AS last_updated
            FROM score_records s
            JOIN identities i ON i.id = s.identity
            ORDER BY s.score DESC, s.last_updated ASC
            LIMIT ?1
            "#,
        )
        .bind(k)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_identities(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM score_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Number of identities that rank strictly ahead of `(score,
    /// last_updated)` under the same tie-break rule as `get_top_k`.
    pub async fn count_ahead(&self, score: i64, last_updated: i64) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM score_records
            WHERE score > ?1 OR (score = ?1 AND last_updated < ?2)
            "#,
        )
        .bind(score)
        .bind(last_updated)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        let db = Database::connect("sqlite::memory:", PoolConfig::default())
            .await
            .unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn duplicate_nonce_is_rejected() {
        let db = test_db().await;
        db.create_identity("u1", "alice", "alice@example.com", "hash")
            .await
            .unwrap();

        db.increment("u1", 5, "nonce-1", 0, None).await.unwrap();
        let err = db.increment("u1", 5, "nonce-1", 0, None).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateNonce));

        let score = db.get_score("u1").await.unwrap().unwrap();
        assert_eq!(score.score, 5);
    }

    #[tokio::test]
    async fn duplicate_username_is_rejected_as_duplicate_identity() {
        let db = test_db().await;
        db.create_identity("u1", "alice", "alice@example.com", "hash")
            .await
            .unwrap();

        let err = db
            .create_identity("u2", "alice", "someone-else@example.com", "hash")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity));
    }

    #[tokio::test]
    async fn last_updated_is_strictly_increasing() {
        let db = test_db().await;
        db.create_identity("u1", "alice", "alice@example.com", "hash")
            .await
            .unwrap();

        let first = db.increment("u1", 1, "n1", 0, None).await.unwrap();
        let second = db.increment("u1", 1, "n2", 0, None).await.unwrap();
        assert!(second.last_updated > first.last_updated);
    }

    #[tokio::test]
    async fn ranking_breaks_ties_by_earlier_update() {
        let db = test_db().await;
        db.create_identity("u1", "alice", "a@example.com", "h")
            .await
            .unwrap();
        db.create_identity("u2", "bob", "b@example.com", "h")
            .await
            .unwrap();

        db.increment("u1", 10, "n1", 0, None).await.unwrap();
        db.increment("u2", 10, "n2", 0, None).await.unwrap();

        let top = db.get_top_k(10).await.unwrap();
        assert_eq!(top[0].identity, "u1");
        assert_eq!(top[1].identity, "u2");
    }
}
