//! Deduplication store. Remembers processed event ids for a TTL.
//!
//! Uses Redis `SET NX EX` for an atomic test-and-set: the first caller for an
//! event id inserts the mark and proceeds, everyone after it within the TTL
//! sees a duplicate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

use courier_common::config::AppConfig;
use courier_common::error::AppError;

/// Default time an event id is remembered (24 hours).
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Existence-only key/value storage with expiry.
#[async_trait]
pub trait DedupBackend: Send + Sync {
    /// Insert `key` with `ttl` unless present. Returns `true` if inserted.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, AppError>;

    /// Insert or refresh `key` with `ttl`.
    async fn set(&self, key: &str, ttl: Duration) -> Result<(), AppError>;

    async fn remove(&self, key: &str) -> Result<(), AppError>;
}

/// Redis-backed dedup marks, shared across instances.
#[derive(Clone)]
pub struct RedisDedupBackend {
    redis: ConnectionManager,
}

impl RedisDedupBackend {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl DedupBackend for RedisDedupBackend {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        let mut conn = self.redis.clone();

        // SET key "1" NX EX ttl
        // Returns Some("OK") if the key was set, None if it already existed
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }

    async fn set(&self, key: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(key, "1", ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

/// In-process marks for single-instance deployments and tests.
#[derive(Default)]
pub struct MemoryDedupBackend {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MemoryDedupBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks currently held, expired ones included until the next write.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DedupBackend for MemoryDedupBackend {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, AppError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires_at| *expires_at > now);
        match entries.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn set(&self, key: &str, ttl: Duration) -> Result<(), AppError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires_at| *expires_at > now);
        entries.insert(key.to_string(), now + ttl);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Event-id deduplication with a fixed TTL.
#[derive(Clone)]
pub struct DedupStore {
    backend: Arc<dyn DedupBackend>,
    ttl: Duration,
}

impl DedupStore {
    pub fn new(backend: Arc<dyn DedupBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn from_config(backend: Arc<dyn DedupBackend>, config: &AppConfig) -> Self {
        Self::new(backend, Duration::from_secs(config.dedup_ttl_seconds))
    }

    /// `None` for blank ids: nothing to deduplicate on.
    fn key(event_id: Option<&str>) -> Option<String> {
        event_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| format!("dedup:event:{}", id))
    }

    /// Test-and-set. `false` the first time an event id is seen within the
    /// TTL (and marks it), `true` on every later call.
    pub async fn is_duplicate(&self, event_id: Option<&str>) -> Result<bool, AppError> {
        let Some(key) = Self::key(event_id) else {
            return Ok(false);
        };
        let inserted = self.backend.set_if_absent(&key, self.ttl).await?;
        if !inserted {
            tracing::debug!(event_id = ?event_id, "Duplicate event suppressed");
        }
        Ok(!inserted)
    }

    /// Mark an event id as seen without asking. Idempotent.
    pub async fn mark_seen(&self, event_id: Option<&str>) -> Result<(), AppError> {
        match Self::key(event_id) {
            Some(key) => self.backend.set(&key, self.ttl).await,
            None => Ok(()),
        }
    }

    /// Forget an event id so it can be submitted again.
    pub async fn release(&self, event_id: Option<&str>) -> Result<(), AppError> {
        match Self::key(event_id) {
            Some(key) => self.backend.remove(&key).await,
            None => Ok(()),
        }
    }
}
