//! Quota tracker: fixed-window send limits per (recipient, channel).
//!
//! The first consumption in a window creates the counter with a TTL equal to
//! the window; later consumptions only increment it. Once `count >= limit`
//! the caller is denied with the counter's remaining TTL as the retry hint.
//!
//! Reading the count and incrementing it are two round trips, so under heavy
//! concurrency a few requests can slip past the limit. That looseness is
//! accepted; the increment itself (with its expiry) is atomic.
//!
//! A consumption whose submission later fails (template or insert error) is
//! handed back with [`QuotaTracker::refund`]. The refund never creates a
//! counter or takes it below zero, and leaves the window's expiry alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use uuid::Uuid;

use courier_common::config::AppConfig;
use courier_common::error::AppError;
use courier_common::types::Channel;

/// INCR the counter and give it a TTL when it has none (new window, or a key
/// left without expiry). Returns the new count.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 or redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// DECR only a live, positive counter so a refund racing the window expiry
/// cannot leave a key without TTL behind.
const DECREMENT_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count > 0 then
    return redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Counter storage shared by every orchestrator instance.
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    /// Current count and remaining TTL in seconds, `(0, None)` when absent.
    async fn current(&self, key: &str) -> Result<(u64, Option<u64>), AppError>;

    /// Atomically increment, setting `window` as expiry on first use.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, AppError>;

    /// Give back one unit of a live counter. No-op when absent or zero.
    async fn decrement(&self, key: &str) -> Result<(), AppError>;

    async fn clear(&self, key: &str) -> Result<(), AppError>;
}

/// Redis-backed counters.
#[derive(Clone)]
pub struct RedisQuotaBackend {
    redis: ConnectionManager,
    script: Arc<redis::Script>,
    refund_script: Arc<redis::Script>,
}

impl RedisQuotaBackend {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            script: Arc::new(redis::Script::new(INCREMENT_SCRIPT)),
            refund_script: Arc::new(redis::Script::new(DECREMENT_SCRIPT)),
        }
    }
}

#[async_trait]
impl QuotaBackend for RedisQuotaBackend {
    async fn current(&self, key: &str) -> Result<(u64, Option<u64>), AppError> {
        let mut conn = self.redis.clone();
        let (count, ttl): (Option<u64>, i64) = redis::pipe()
            .get(key)
            .ttl(key)
            .query_async(&mut conn)
            .await?;

        // TTL is -2 for a missing key and -1 for a key without expiry.
        let ttl = u64::try_from(ttl).ok();
        Ok((count.unwrap_or(0), ttl))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u64, AppError> {
        let mut conn = self.redis.clone();
        let count: u64 = self
            .script
            .key(key)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn decrement(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        self.refund_script
            .key(key)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process counters for single-instance deployments and tests.
///
/// Uses `tokio::time::Instant` so tests can move the window with
/// `tokio::time::advance`.
#[derive(Default)]
pub struct MemoryQuotaBackend {
    counters: Mutex<HashMap<String, (u64, Instant)>>,
}

impl MemoryQuotaBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters currently held, expired ones included until the next write.
    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.lock().is_empty()
    }
}

#[async_trait]
impl QuotaBackend for MemoryQuotaBackend {
    async fn current(&self, key: &str) -> Result<(u64, Option<u64>), AppError> {
        let now = Instant::now();
        let counters = self.counters.lock();
        Ok(match counters.get(key) {
            Some((count, expires_at)) if *expires_at > now => {
                let remaining = expires_at.duration_since(now);
                // Round up so a live counter never reports a zero retry hint.
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                (*count, Some(secs))
            }
            _ => (0, None),
        })
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<u64, AppError> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        counters.retain(|_, (_, expires_at)| *expires_at > now);
        let entry = counters
            .entry(key.to_string())
            .or_insert((0, now + window));
        if entry.1 <= now {
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn decrement(&self, key: &str) -> Result<(), AppError> {
        let now = Instant::now();
        if let Some((count, expires_at)) = self.counters.lock().get_mut(key) {
            if *expires_at > now {
                *count = count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), AppError> {
        self.counters.lock().remove(key);
        Ok(())
    }
}

/// Result of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Consumption recorded; `remaining` sends left in this window
    /// (`None` when the channel has no configured limit).
    Allowed { remaining: Option<u64> },
    Denied { limit: u64, retry_after_seconds: u64 },
}

/// Per-channel limits over one shared window length.
#[derive(Debug, Clone)]
pub struct QuotaLimits {
    pub window: Duration,
    limits: HashMap<Channel, u64>,
}

impl QuotaLimits {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            limits: HashMap::new(),
        }
    }

    pub fn with_limit(mut self, channel: Channel, limit: u64) -> Self {
        self.limits.insert(channel, limit);
        self
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(Duration::from_secs(config.quota_window_seconds))
            .with_limit(Channel::Email, config.quota_email_limit)
            .with_limit(Channel::Sms, config.quota_sms_limit)
            .with_limit(Channel::Push, config.quota_push_limit)
            .with_limit(Channel::InApp, config.quota_in_app_limit)
    }

    pub fn limit_for(&self, channel: Channel) -> Option<u64> {
        self.limits.get(&channel).copied()
    }
}

/// Fixed-window quota tracker.
#[derive(Clone)]
pub struct QuotaTracker {
    backend: Arc<dyn QuotaBackend>,
    limits: Arc<QuotaLimits>,
}

impl QuotaTracker {
    pub fn new(backend: Arc<dyn QuotaBackend>, limits: QuotaLimits) -> Self {
        Self {
            backend,
            limits: Arc::new(limits),
        }
    }

    fn key(subject: Uuid, channel: Channel) -> String {
        format!("quota:{}:{}", subject, channel)
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    /// Consume one send for `subject` on `channel` if the window allows it.
    pub async fn check_and_consume(
        &self,
        subject: Uuid,
        channel: Channel,
    ) -> Result<QuotaDecision, AppError> {
        let Some(limit) = self.limits.limit_for(channel) else {
            return Ok(QuotaDecision::Allowed { remaining: None });
        };
        let key = Self::key(subject, channel);
        let window = self.limits.window;

        let (count, ttl) = self.backend.current(&key).await?;
        if count >= limit {
            let retry_after_seconds = ttl.unwrap_or(window.as_secs()).min(window.as_secs());
            tracing::debug!(
                recipient_id = %subject,
                channel = %channel,
                count,
                limit,
                retry_after_seconds,
                "Quota exhausted"
            );
            return Ok(QuotaDecision::Denied {
                limit,
                retry_after_seconds,
            });
        }

        let count = self.backend.increment(&key, window).await?;
        Ok(QuotaDecision::Allowed {
            remaining: Some(limit.saturating_sub(count)),
        })
    }

    /// Hand back a consumption whose submission did not go through.
    pub async fn refund(&self, subject: Uuid, channel: Channel) -> Result<(), AppError> {
        if self.limits.limit_for(channel).is_none() {
            return Ok(());
        }
        self.backend.decrement(&Self::key(subject, channel)).await
    }

    /// Sends left in the current window. Advisory only.
    pub async fn remaining_quota(
        &self,
        subject: Uuid,
        channel: Channel,
    ) -> Result<Option<u64>, AppError> {
        let Some(limit) = self.limits.limit_for(channel) else {
            return Ok(None);
        };
        let (count, _) = self.backend.current(&Self::key(subject, channel)).await?;
        Ok(Some(limit.saturating_sub(count)))
    }

    /// Whether the next consumption would be denied. Advisory only.
    pub async fn is_limited(&self, subject: Uuid, channel: Channel) -> Result<bool, AppError> {
        Ok(self.remaining_quota(subject, channel).await? == Some(0))
    }

    /// Drop the counter, opening a fresh window on the next send.
    pub async fn reset(&self, subject: Uuid, channel: Channel) -> Result<(), AppError> {
        self.backend.clear(&Self::key(subject, channel)).await
    }
}
