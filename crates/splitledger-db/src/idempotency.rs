//! Idempotency window
//!
//! Remembers which external payment ids were already processed, for a
//! bounded time. An id whose entry has aged out may be accepted again;
//! the unique constraint on transactions still stops a second record.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use deadpool_redis::{redis::AsyncCommands, Config as RedisConfig, Pool as RedisPool, Runtime};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{DbError, DbResult};

/// Default window during which a processed id is remembered, in seconds
pub const DEFAULT_TTL_SECS: i64 = 24 * 60 * 60;

/// Default entry count above which the in-process map is swept
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// TTL key/value abstraction behind the guard
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// When the key was first marked, if it is still stored
    async fn first_seen(&self, key: &str) -> DbResult<Option<DateTime<Utc>>>;

    async fn insert(&self, key: &str, seen_at: DateTime<Utc>, ttl: Duration) -> DbResult<()>;

    async fn remove(&self, key: &str) -> DbResult<()>;

    /// Drop every entry first seen before `older_than`; returns how many
    async fn sweep(&self, older_than: DateTime<Utc>) -> DbResult<usize>;

    /// Number of stored entries, or 0 where the backend expires keys itself
    async fn len(&self) -> DbResult<usize>;
}

// ============================================================================
// In-process store
// ============================================================================

/// `RwLock<HashMap>` store for single-instance deployments and tests
#[derive(Clone, Default)]
pub struct MemoryIdempotencyStore {
    entries: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn first_seen(&self, key: &str) -> DbResult<Option<DateTime<Utc>>> {
        Ok(self.entries.read().await.get(key).copied())
    }

    async fn insert(&self, key: &str, seen_at: DateTime<Utc>, _ttl: Duration) -> DbResult<()> {
        self.entries
            .write()
            .await
            .entry(key.to_string())
            .or_insert(seen_at);
        Ok(())
    }

    async fn remove(&self, key: &str) -> DbResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn sweep(&self, older_than: DateTime<Utc>) -> DbResult<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, seen_at| *seen_at >= older_than);
        Ok(before - entries.len())
    }

    async fn len(&self) -> DbResult<usize> {
        Ok(self.entries.read().await.len())
    }
}

// ============================================================================
// Redis store
// ============================================================================

/// Redis key prefix for idempotency entries
pub const KEY_PREFIX: &str = "idem:";

/// Shared window across instances; keys expire natively via `SET .. EX`
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    pool: RedisPool,
}

impl RedisIdempotencyStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    /// Build a pool and check the server answers `PING`
    pub async fn connect(redis_url: &str) -> DbResult<Self> {
        info!("Connecting to Redis: {}", crate::config::mask_url(redis_url));

        let pool = RedisConfig::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| DbError::Connection(format!("Redis: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| DbError::Connection(format!("Redis pool: {}", e)))?;
        let _: String = deadpool_redis::redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| DbError::Connection(format!("Redis ping: {}", e)))?;

        info!("Connected to Redis");
        Ok(Self { pool })
    }

    fn key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn first_seen(&self, key: &str) -> DbResult<Option<DateTime<Utc>>> {
        let mut conn = self.pool.get().await?;
        let value: Option<i64> = conn.get(Self::key(key)).await?;
        Ok(value.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }

    async fn insert(&self, key: &str, seen_at: DateTime<Utc>, ttl: Duration) -> DbResult<()> {
        let mut conn = self.pool.get().await?;
        let ttl_secs = ttl.num_seconds().max(1) as u64;

        // NX keeps the first-seen time of an id marked twice
        let _: Option<String> = deadpool_redis::redis::cmd("SET")
            .arg(Self::key(key))
            .arg(seen_at.timestamp_millis())
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> DbResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = conn.del(Self::key(key)).await?;
        Ok(())
    }

    async fn sweep(&self, _older_than: DateTime<Utc>) -> DbResult<usize> {
        Ok(0)
    }

    async fn len(&self) -> DbResult<usize> {
        Ok(0)
    }
}

// ============================================================================
// Guard
// ============================================================================

/// Time-bounded set of processed external payment ids
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    max_entries: usize,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            store,
            ttl,
            max_entries,
        }
    }

    /// In-process guard with default window
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryIdempotencyStore::new()),
            Duration::seconds(DEFAULT_TTL_SECS),
            DEFAULT_MAX_ENTRIES,
        )
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// True only if `key` was marked within the window
    pub async fn has_been_processed(&self, key: &str) -> DbResult<bool> {
        self.has_been_processed_at(key, Utc::now()).await
    }

    pub async fn has_been_processed_at(&self, key: &str, now: DateTime<Utc>) -> DbResult<bool> {
        match self.store.first_seen(key).await? {
            Some(seen_at) if now - seen_at < self.ttl => Ok(true),
            Some(_) => {
                debug!(key, "Evicting stale idempotency entry");
                self.store.remove(key).await?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Remember `key` as processed
    pub async fn mark_processed(&self, key: &str) -> DbResult<()> {
        self.mark_processed_at(key, Utc::now()).await
    }

    pub async fn mark_processed_at(&self, key: &str, now: DateTime<Utc>) -> DbResult<()> {
        self.store.insert(key, now, self.ttl).await?;

        if self.store.len().await? > self.max_entries {
            let removed = self.store.sweep(now - self.ttl).await?;
            debug!(removed, "Swept expired idempotency entries");
        }
        Ok(())
    }
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}
