//! Fixed-window rate limiting shared across workers
//!
//! Counters live in a [`CounterStore`] so every worker process sees the same
//! totals. A key is namespaced by limiter name, caller key and window index
//! (`now / window_ms`). When the store is unreachable the limiter allows the
//! request and logs a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::config::RateLimitsConfig;
use crate::db::Database;
use crate::error::{DbError, Result, SyndicastError};

/// Requests allowed per window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Epoch milliseconds at which the current window ends
    pub reset_at_ms: i64,
}

/// Shared atomic counters with expiry
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new count.
    ///
    /// `expires_at_ms` is attached only when the increment creates the key.
    async fn increment(&self, key: &str, expires_at_ms: i64) -> Result<u64>;

    /// Current count for `key`, zero when absent or expired
    async fn get(&self, key: &str, now_ms: i64) -> Result<u64>;

    /// Drop expired windows. Stores with native expiry have nothing to do.
    async fn cleanup(&self, now_ms: i64) -> Result<u64> {
        let _ = now_ms;
        Ok(0)
    }
}

/// Counter store in the application database
#[derive(Clone)]
pub struct SqliteCounterStore {
    pool: SqlitePool,
}

impl SqliteCounterStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    async fn increment(&self, key: &str, expires_at_ms: i64) -> Result<u64> {
        let row = sqlx::query(
            r#"
            INSERT INTO rate_limit_counters (key, count, expires_at)
            VALUES (?, 1, ?)
            ON CONFLICT(key) DO UPDATE SET count = count + 1
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(expires_at_ms)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(u64::try_from(row.get::<i64, _>("count")).unwrap_or(0))
    }

    async fn get(&self, key: &str, now_ms: i64) -> Result<u64> {
        let count: Option<i64> = sqlx::query(
            "SELECT count FROM rate_limit_counters WHERE key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?
        .map(|row| row.get("count"));

        Ok(count.and_then(|c| u64::try_from(c).ok()).unwrap_or(0))
    }

    async fn cleanup(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_counters WHERE expires_at <= ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(result.rows_affected())
    }
}

/// Per-process counters. Limits are not shared between workers.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<String, (u64, i64)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, expires_at_ms: i64) -> Result<u64> {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = counters.entry(key.to_string()).or_insert((0, expires_at_ms));
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn get(&self, key: &str, now_ms: i64) -> Result<u64> {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(counters
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now_ms)
            .map_or(0, |(count, _)| *count))
    }

    async fn cleanup(&self, now_ms: i64) -> Result<u64> {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = counters.len();
        counters.retain(|_, (_, expires_at)| *expires_at > now_ms);
        Ok((before - counters.len()) as u64)
    }
}

/// Counters in Redis using `INCR` plus `PEXPIREAT` on the first hit
#[cfg(feature = "redis")]
#[derive(Clone)]
pub struct RedisCounterStore {
    client: redis::Client,
}

#[cfg(feature = "redis")]
impl RedisCounterStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            crate::error::ConfigError::InvalidValue {
                field: "rate_limits.redis_url".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_error)
    }
}

#[cfg(feature = "redis")]
fn redis_error(e: redis::RedisError) -> SyndicastError {
    SyndicastError::Database(DbError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("redis: {}", e),
    )))
}

#[cfg(feature = "redis")]
#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, expires_at_ms: i64) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: u64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        if count == 1 {
            let _: () = redis::cmd("PEXPIREAT")
                .arg(key)
                .arg(expires_at_ms)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
        }
        Ok(count)
    }

    async fn get(&self, key: &str, _now_ms: i64) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(count.unwrap_or(0))
    }
}

/// A named fixed-window limiter
#[derive(Clone)]
pub struct RateLimiter {
    name: String,
    policy: RateLimitPolicy,
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, policy: RateLimitPolicy, store: Arc<dyn CounterStore>) -> Self {
        Self {
            name: name.into(),
            policy,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    fn window(&self, key: &str, now_ms: i64) -> (String, i64) {
        let window_ms = i64::try_from(self.policy.window_ms.max(1)).unwrap_or(i64::MAX);
        let index = now_ms.div_euclid(window_ms);
        let reset_at = index.saturating_add(1).saturating_mul(window_ms);
        (format!("{}:{}:{}", self.name, key, index), reset_at)
    }

    /// Count one request against `key`
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, chrono::Utc::now().timestamp_millis()).await
    }

    pub async fn check_at(&self, key: &str, now_ms: i64) -> RateLimitDecision {
        let (counter_key, reset_at_ms) = self.window(key, now_ms);
        let max = u64::from(self.policy.max_requests);

        match self.store.increment(&counter_key, reset_at_ms).await {
            Ok(count) => RateLimitDecision {
                allowed: count <= max,
                remaining: u32::try_from(max.saturating_sub(count)).unwrap_or(0),
                reset_at_ms,
            },
            Err(e) => {
                tracing::warn!(
                    limiter = %self.name,
                    key = %key,
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                RateLimitDecision {
                    allowed: true,
                    remaining: self.policy.max_requests,
                    reset_at_ms,
                }
            }
        }
    }

    /// Count one request, failing with [`SyndicastError::RateLimited`] once
    /// the window is exhausted
    pub async fn consume(&self, key: &str) -> Result<RateLimitDecision> {
        self.consume_at(key, chrono::Utc::now().timestamp_millis()).await
    }

    pub async fn consume_at(&self, key: &str, now_ms: i64) -> Result<RateLimitDecision> {
        let decision = self.check_at(key, now_ms).await;
        if !decision.allowed {
            tracing::debug!(limiter = %self.name, key = %key, "Rate limit exceeded");
            return Err(SyndicastError::RateLimited {
                key: format!("{}:{}", self.name, key),
                reset_at_ms: decision.reset_at_ms,
            });
        }
        Ok(decision)
    }

    /// Read the current window without counting a request
    pub async fn peek_at(&self, key: &str, now_ms: i64) -> RateLimitDecision {
        let (counter_key, reset_at_ms) = self.window(key, now_ms);
        let max = u64::from(self.policy.max_requests);
        let count = match self.store.get(&counter_key, now_ms).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(limiter = %self.name, error = %e, "Rate limit store unavailable");
                0
            }
        };
        RateLimitDecision {
            allowed: count < max,
            remaining: u32::try_from(max.saturating_sub(count)).unwrap_or(0),
            reset_at_ms,
        }
    }
}

/// The limiters workers consult
#[derive(Clone)]
pub struct RateLimiters {
    /// Generic platform API calls
    pub api: RateLimiter,
    /// Publish actions, keyed by social account
    pub publish: RateLimiter,
    /// AI generation calls
    pub ai: RateLimiter,
}

impl RateLimiters {
    pub fn new(config: &RateLimitsConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            api: RateLimiter::new("api", config.api, store.clone()),
            publish: RateLimiter::new("publish", config.publish, store.clone()),
            ai: RateLimiter::new("ai", config.ai, store),
        }
    }

    /// Build the store named by the configuration
    ///
    /// Uses Redis when `redis_url` is set and the `redis` feature is
    /// enabled, otherwise the database.
    pub fn from_config(config: &RateLimitsConfig, db: &Database) -> Result<Self> {
        let store: Arc<dyn CounterStore> = match config.redis_url.as_deref() {
            #[cfg(feature = "redis")]
            Some(url) => Arc::new(RedisCounterStore::new(url)?),
            #[cfg(not(feature = "redis"))]
            Some(_) => {
                tracing::warn!(
                    "rate_limits.redis_url is set but redis support is not compiled in, using the database"
                );
                Arc::new(SqliteCounterStore::new(db))
            }
            None => Arc::new(SqliteCounterStore::new(db)),
        };
        Ok(Self::new(config, store))
    }

    /// Remove expired counter windows from the shared store
    pub async fn purge_expired(&self) -> Result<u64> {
        self.api
            .store
            .cleanup(chrono::Utc::now().timestamp_millis())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn increment(&self, _key: &str, _expires_at_ms: i64) -> Result<u64> {
            Err(DbError::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
            .into())
        }

        async fn get(&self, _key: &str, _now_ms: i64) -> Result<u64> {
            Err(DbError::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
            .into())
        }
    }

    fn memory_limiter(max_requests: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(
            "test",
            RateLimitPolicy::new(max_requests, window_ms),
            Arc::new(MemoryCounterStore::new()),
        )
    }

    #[tokio::test]
    async fn test_fourth_call_in_window_is_rejected() {
        let limiter = memory_limiter(3, 1000);
        let now = 10_000;

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.consume_at("acc-1", now).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let result = limiter.consume_at("acc-1", now + 500).await;
        match result {
            Err(SyndicastError::RateLimited { key, reset_at_ms }) => {
                assert_eq!(key, "test:acc-1");
                assert_eq!(reset_at_ms, 11_000);
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_window_resets() {
        let limiter = memory_limiter(3, 1000);
        for _ in 0..3 {
            limiter.consume_at("acc-1", 10_000).await.unwrap();
        }
        assert!(limiter.consume_at("acc-1", 10_999).await.is_err());

        let decision = limiter.consume_at("acc-1", 11_000).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = memory_limiter(1, 1000);
        assert!(limiter.check_at("acc-1", 0).await.allowed);
        assert!(!limiter.check_at("acc-1", 0).await.allowed);
        assert!(limiter.check_at("acc-2", 0).await.allowed);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unreachable() {
        let limiter = RateLimiter::new(
            "publish",
            RateLimitPolicy::new(1, 1000),
            Arc::new(UnreachableStore),
        );

        for _ in 0..5 {
            let decision = limiter.consume_at("acc-1", 0).await.unwrap();
            assert!(decision.allowed);
        }
        assert!(limiter.peek_at("acc-1", 0).await.allowed);
    }

    #[tokio::test]
    async fn test_peek_does_not_count() {
        let limiter = memory_limiter(2, 1000);
        limiter.check_at("acc-1", 0).await;

        let peeked = limiter.peek_at("acc-1", 0).await;
        assert_eq!(peeked.remaining, 1);
        let peeked = limiter.peek_at("acc-1", 0).await;
        assert_eq!(peeked.remaining, 1);
    }

    #[tokio::test]
    async fn test_limiters_share_store_but_not_counts() {
        let config = RateLimitsConfig {
            redis_url: None,
            api: RateLimitPolicy::new(1, 60_000),
            publish: RateLimitPolicy::new(1, 60_000),
            ai: RateLimitPolicy::new(1, 60_000),
        };
        let limiters = RateLimiters::new(&config, Arc::new(MemoryCounterStore::new()));

        assert!(limiters.publish.consume_at("acc-1", 0).await.is_ok());
        assert!(limiters.api.consume_at("acc-1", 0).await.is_ok());
        assert!(limiters.publish.consume_at("acc-1", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_store_counts_across_handles() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();

        let policy = RateLimitPolicy::new(3, 1000);
        let first = RateLimiter::new("publish", policy, Arc::new(SqliteCounterStore::new(&db)));
        let second = RateLimiter::new("publish", policy, Arc::new(SqliteCounterStore::new(&db)));

        first.consume_at("acc-1", 5_000).await.unwrap();
        second.consume_at("acc-1", 5_100).await.unwrap();
        first.consume_at("acc-1", 5_200).await.unwrap();
        assert!(second.consume_at("acc-1", 5_300).await.is_err());
        assert!(first.consume_at("acc-1", 6_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_sqlite_store_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let store = SqliteCounterStore::new(&db);

        store.increment("publish:acc-1:5", 6_000).await.unwrap();
        store.increment("publish:acc-1:6", 7_000).await.unwrap();

        assert_eq!(store.get("publish:acc-1:5", 5_500).await.unwrap(), 1);
        assert_eq!(store.cleanup(6_500).await.unwrap(), 1);
        assert_eq!(store.get("publish:acc-1:5", 0).await.unwrap(), 0);
        assert_eq!(store.get("publish:acc-1:6", 6_500).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_cleanup_keeps_live_windows() {
        let store = MemoryCounterStore::new();
        store.increment("api:acc-1:0", 1_000).await.unwrap();
        store.increment("api:acc-1:1", 2_000).await.unwrap();

        assert_eq!(store.cleanup(1_500).await.unwrap(), 1);
        assert_eq!(store.get("api:acc-1:1", 1_500).await.unwrap(), 1);
    }
}
