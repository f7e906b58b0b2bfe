use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Type alias for the in-flight requests map, same shape as the
/// single-flight registry in the multi-tier cache manager this is
/// modeled on.
type InFlightMap = DashMap<String, Arc<Mutex<()>>>;

struct CleanupGuard<'a> {
    map: &'a InFlightMap,
    key: String,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

struct L1Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

impl CacheStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Two-tier cache: an in-process `DashMap` (L1) in front of Redis (L2),
/// degrading to L1-only when Redis is unreachable. Concurrent misses on
/// the same key collapse onto a single `loader` call via the in-flight
/// registry.
pub struct CacheManager {
    l1: DashMap<String, L1Entry>,
    l2: RwLock<Option<MultiplexedConnection>>,
    in_flight: InFlightMap,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheManager {
    pub async fn connect(redis_url: &str) -> Self {
        let connection = match redis::Client::open(redis_url) {
            Ok(client) => match client.get_multiplexed_tokio_connection().await {
                Ok(conn) => {
                    tracing::info!("connected to Redis for L2 cache");
                    Some(conn)
                }
                Err(e) => {
                    warn!("Redis unreachable ({e}), running cache in L1-only mode");
                    None
                }
            },
            Err(e) => {
                warn!("invalid REDIS_URL ({e}), running cache in L1-only mode");
                None
            }
        };

        Self {
            l1: DashMap::new(),
            l2: RwLock::new(connection),
            in_flight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn get_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
    }

    /// Approximate L1 footprint in bytes, reported by `/health` as
    /// `cache.memoryUsage`. Only L1 is sized here — L2 is shared Redis
    /// state, not this process's memory.
    pub fn l1_memory_bytes(&self) -> usize {
        self.l1.iter().map(|entry| entry.value.len() + entry.key().len()).sum()
    }

    fn l1_get(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.l1.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.l1.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn l1_set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.l1.insert(
            key.to_string(),
            L1Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn l2_get(&self, key: &str) -> Option<Vec<u8>> {
        let mut guard = self.l2.write().await;
        let conn = guard.as_mut()?;
        match conn.get::<_, Option<Vec<u8>>>(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("redis GET failed for '{key}': {e}");
                None
            }
        }
    }

    async fn l2_set(&self, key: &str, value: &[u8], ttl: Duration) {
        let mut guard = self.l2.write().await;
        if let Some(conn) = guard.as_mut() {
            let seconds = ttl.as_secs().max(1);
            if let Err(e) = conn.set_ex::<_, _, ()>(key, value, seconds).await {
                warn!("redis SET failed for '{key}': {e}");
            }
        }
    }

    async fn l2_del(&self, key: &str) {
        let mut guard = self.l2.write().await;
        if let Some(conn) = guard.as_mut() {
            if let Err(e) = conn.del::<_, ()>(key).await {
                warn!("redis DEL failed for '{key}': {e}");
            }
        }
    }

    /// L1 -> L2 -> single-flight `loader` -> write-back L2 then L1.
    /// `l1_ttl` and `l2_ttl` are independent so callers like `top:K`, whose
    /// L1 entry must expire much sooner than its L2 entry to bound
    /// staleness after a concurrent invalidate, can say so.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        l1_ttl: Duration,
        l2_ttl: Duration,
        loader: F,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send,
    {
        if let Some(bytes) = self.l1_get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(serde_json::from_slice(&bytes)?);
        }

        let key_owned = key.to_string();
        let lock = self
            .in_flight
            .entry(key_owned.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _permit = lock.lock().await;
        let _cleanup = CleanupGuard {
            map: &self.in_flight,
            key: key_owned,
        };

        if let Some(bytes) = self.l1_get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(serde_json::from_slice(&bytes)?);
        }

        if let Some(bytes) = self.l2_get(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.l1_set(key, bytes.clone(), l1_ttl);
            return Ok(serde_json::from_slice(&bytes)?);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!("computing fresh value for '{key}'");
        let value = loader().await?;
        let bytes = serde_json::to_vec(&value)?;
        self.l2_set(key, &bytes, l2_ttl).await;
        self.l1_set(key, bytes, l1_ttl);
        Ok(value)
    }

    /// Invalidates L2 before L1. Reversing this order would let a reader
    /// that misses L1 just after the L1 removal still find the stale L2
    /// entry and repopulate L1 with it, widening the staleness window to
    /// the L2 TTL instead of bounding it at this call.
    pub async fn invalidate(&self, key: &str) {
        self.l2_del(key).await;
        self.l1.remove(key);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Fast-path duplicate check for action nonces, ahead of the Store's
    /// authoritative unique-constraint check.
    pub async fn has_marker(&self, key: &str) -> bool {
        if self.l1_get(key).is_some() {
            return true;
        }
        self.l2_get(key).await.is_some()
    }

    pub async fn set_marker(&self, key: &str, ttl: Duration) {
        let bytes = b"1".to_vec();
        self.l2_set(key, &bytes, ttl).await;
        self.l1_set(key, bytes, ttl);
    }

    /// Atomic increment-and-expire used for rate-limit counters
    /// (`rl:<scope>:<id>`). Falls back to a process-local counter when
    /// Redis is unreachable, same degradation policy as the rest of this
    /// cache.
    pub async fn incr_with_expiry(&self, key: &str, window: Duration) -> i64 {
        let mut guard = self.l2.write().await;
        if let Some(conn) = guard.as_mut() {
            let count: redis::RedisResult<i64> = conn.incr(key, 1).await;
            if let Ok(count) = count {
                if count == 1 {
                    let _: redis::RedisResult<()> =
                        conn.expire(key, window.as_secs().max(1) as i64).await;
                }
                return count;
            }
            warn!("redis INCR failed for '{key}', falling back to local counter");
        }
        drop(guard);
        self.local_incr(key, window)
    }

    fn local_incr(&self, key: &str, window: Duration) -> i64 {
        let now = Instant::now();
        let mut entry = self
            .l1
            .entry(format!("__ratelimit__:{key}"))
            .or_insert_with(|| L1Entry {
                value: 0i64.to_be_bytes().to_vec(),
                expires_at: now + window,
            });

        if entry.expires_at <= now {
            entry.value = 0i64.to_be_bytes().to_vec();
            entry.expires_at = now + window;
        }

        let count = i64::from_be_bytes(entry.value.clone().try_into().unwrap_or([0; 8])) + 1;
        entry.value = count.to_be_bytes().to_vec();
        count
    }

    /// Drops every local L1 entry. Used by the `/cache/clear` admin
    /// endpoint; L2 entries are left to expire on their own TTL rather
    /// than issuing a destructive `FLUSHDB` against shared Redis state.
    pub fn clear_l1(&self) {
        self.l1.clear();
    }

    pub async fn health_check(&self) -> bool {
        let mut guard = self.l2.write().await;
        match guard.as_mut() {
            Some(conn) => redis::cmd("PING")
                .query_async::<_, String>(conn)
                .await
                .is_ok(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn l1_only_get_or_load_computes_once() {
        let cache = CacheManager::connect("redis://127.0.0.1:1").await;
        let calls = Arc::new(AtomicU64::new(0));

        let ttl = Duration::from_secs(60);
        let calls_clone = calls.clone();
        let value: i32 = cache
            .get_or_load("k", ttl, ttl, || async move {
                calls_clone.fetch_add(1, Ordering::Relaxed);
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let calls_clone = calls.clone();
        let value: i32 = cache
            .get_or_load("k", ttl, ttl, || async move {
                calls_clone.fetch_add(1, Ordering::Relaxed);
                Ok(0)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_recompute() {
        let cache = CacheManager::connect("redis://127.0.0.1:1").await;
        let ttl = Duration::from_secs(60);
        let _: i32 = cache
            .get_or_load("k", ttl, ttl, || async { Ok(1) })
            .await
            .unwrap();

        cache.invalidate("k").await;

        let value: i32 = cache
            .get_or_load("k", ttl, ttl, || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(cache.get_stats().invalidations, 1);
    }
}
