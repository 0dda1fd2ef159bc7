//! Work-item transport with at-least-once delivery.
//!
//! Producers publish `(topic, key, value)`; the key picks one of a fixed
//! number of partitions. Consumers read one partition and acknowledge each
//! item only after it has been fully handled. Anything read but not acked is
//! handed out again: to the same consumer when it restarts under its old
//! name, or to any consumer of the group once the entry has sat idle for the
//! claim-idle period.
//!
//! Production runs on Redis Streams (`XADD` / `XREADGROUP` / `XACK`, and
//! `XAUTOCLAIM`, so Redis 6.2 or later), one stream per partition named
//! `{topic}:{partition}`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tokio::sync::Notify;

use courier_common::error::AppError;
use courier_common::types::WorkItem;

/// Stream entry field carrying the published value.
const VALUE_FIELD: &str = "value";

/// Upper bound of `XAUTOCLAIM` pages walked in one adoption pass.
const MAX_CLAIM_PAGES: usize = 10;

/// One received item plus what is needed to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub stream: String,
    pub receipt: String,
    pub value: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, value: &str) -> Result<(), AppError>;

    async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        consumer: &str,
    ) -> Result<Box<dyn TransportStream>, AppError>;

    fn partitions(&self) -> u32;
}

#[async_trait]
pub trait TransportStream: Send {
    /// Wait for the next item. `None` means nothing arrived within the
    /// transport's block timeout; callers loop.
    async fn next(&mut self) -> Result<Option<Envelope>, AppError>;

    async fn ack(&mut self, envelope: &Envelope) -> Result<(), AppError>;
}

/// Partition for `key`: FNV-1a, stable across processes and builds.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let hash = key.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    });
    hash % partitions.max(1)
}

pub fn stream_name(topic: &str, partition: u32) -> String {
    format!("{}:{}", topic, partition)
}

/// Publish a work item keyed by its notification id.
pub async fn publish_work_item(
    transport: &dyn Transport,
    topic: &str,
    item: WorkItem,
) -> Result<(), AppError> {
    let value = serde_json::to_string(&item)?;
    transport
        .publish(topic, &item.notification_id.to_string(), &value)
        .await
}

// ============================================================
// Redis Streams
// ============================================================

/// Redis Streams transport with one consumer group shared by all workers.
pub struct RedisStreamTransport {
    client: Client,
    publisher: ConnectionManager,
    group: String,
    partitions: u32,
    block: Duration,
    batch_size: usize,
    max_len: usize,
    claim_idle: Duration,
}

impl RedisStreamTransport {
    pub const DEFAULT_GROUP: &'static str = "courier-workers";

    pub async fn connect(redis_url: &str, partitions: u32, block: Duration) -> Result<Self, AppError> {
        let client = Client::open(redis_url)?;
        let publisher = client.get_connection_manager().await?;
        Ok(Self {
            client,
            publisher,
            group: Self::DEFAULT_GROUP.to_string(),
            partitions: partitions.max(1),
            block,
            batch_size: 16,
            max_len: 100_000,
            claim_idle: Duration::from_secs(300),
        })
    }

    /// How long an entry must sit unacked in another consumer's pending list
    /// before this transport's consumers adopt it.
    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }
}

#[async_trait]
impl Transport for RedisStreamTransport {
    async fn publish(&self, topic: &str, key: &str, value: &str) -> Result<(), AppError> {
        let stream = stream_name(topic, partition_for(key, self.partitions));
        let mut conn = self.publisher.clone();

        // XADD stream MAXLEN ~ n * value <payload>
        let _: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(VALUE_FIELD)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Transport(format!("XADD {} failed: {}", stream, e)))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        consumer: &str,
    ) -> Result<Box<dyn TransportStream>, AppError> {
        let stream = stream_name(topic, partition);
        // Blocking reads park the connection, so each consumer owns one.
        let mut conn = self.client.get_connection_manager().await?;

        // Start at "0" so entries published before the group existed are kept.
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => tracing::info!(stream = %stream, group = %self.group, "Consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Box::new(RedisStream {
            conn,
            stream,
            group: self.group.clone(),
            consumer: consumer.to_string(),
            block: self.block,
            batch_size: self.batch_size,
            claim_idle: self.claim_idle,
            last_adoption: None,
            draining_pending: true,
            buffer: VecDeque::new(),
        }))
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }
}

struct RedisStream {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    block: Duration,
    batch_size: usize,
    claim_idle: Duration,
    last_adoption: Option<tokio::time::Instant>,
    /// Re-read our own unacked entries (cursor "0") before taking new ones (">").
    draining_pending: bool,
    buffer: VecDeque<Envelope>,
}

impl RedisStream {
    /// Move entries idle for `claim_idle` from any consumer of the group to
    /// this one. `JUSTID` leaves delivery to the pending-list drain in
    /// [`Self::fill`].
    async fn adopt_idle(&mut self) -> Result<usize, AppError> {
        let mut cursor = "0-0".to_string();
        let mut adopted = 0;

        for _ in 0..MAX_CLAIM_PAGES {
            let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
                .arg(&self.stream)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(self.claim_idle.as_millis() as u64)
                .arg(&cursor)
                .arg("COUNT")
                .arg(self.batch_size)
                .arg("JUSTID")
                .query_async(&mut self.conn)
                .await
                .map_err(|e| {
                    AppError::Transport(format!("XAUTOCLAIM {} failed: {}", self.stream, e))
                })?;

            let (next, claimed) = parse_autoclaim(&reply)?;
            adopted += claimed;
            if next == "0-0" {
                break;
            }
            cursor = next;
        }

        Ok(adopted)
    }

    async fn fill(&mut self) -> Result<(), AppError> {
        let adoption_due = self
            .last_adoption
            .is_none_or(|at| at.elapsed() >= self.claim_idle);
        if adoption_due {
            self.last_adoption = Some(tokio::time::Instant::now());
            let adopted = self.adopt_idle().await?;
            if adopted > 0 {
                tracing::info!(
                    stream = %self.stream,
                    consumer = %self.consumer,
                    adopted,
                    "Adopted idle entries from other consumers"
                );
                self.draining_pending = true;
            }
        }

        let cursor = if self.draining_pending { "0" } else { ">" };
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(self.batch_size)
            .block(self.block.as_millis() as usize);

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream], &[cursor], &options)
            .await?;

        let entries: Vec<_> = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();

        if self.draining_pending && entries.is_empty() {
            tracing::debug!(stream = %self.stream, consumer = %self.consumer, "Pending entries drained");
            self.draining_pending = false;
        }

        for entry in entries {
            match entry.get::<String>(VALUE_FIELD) {
                Some(value) => self.buffer.push_back(Envelope {
                    stream: self.stream.clone(),
                    receipt: entry.id,
                    value,
                }),
                None => {
                    tracing::warn!(stream = %self.stream, entry_id = %entry.id, "Dropping malformed stream entry");
                    self.conn
                        .xack::<_, _, _, ()>(&self.stream, &self.group, &[&entry.id])
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransportStream for RedisStream {
    async fn next(&mut self) -> Result<Option<Envelope>, AppError> {
        if self.buffer.is_empty() {
            self.fill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn ack(&mut self, envelope: &Envelope) -> Result<(), AppError> {
        self.conn
            .xack::<_, _, _, ()>(&envelope.stream, &self.group, &[&envelope.receipt])
            .await?;
        Ok(())
    }
}

/// Next cursor and number of claimed ids from an `XAUTOCLAIM ... JUSTID`
/// reply. Redis 7 appends a third element (deleted ids), which is ignored.
fn parse_autoclaim(reply: &[redis::Value]) -> Result<(String, usize), AppError> {
    let (Some(cursor), Some(ids)) = (reply.first(), reply.get(1)) else {
        return Err(AppError::Transport(format!(
            "Unexpected XAUTOCLAIM reply with {} elements",
            reply.len()
        )));
    };
    let cursor: String = redis::from_redis_value(cursor)?;
    let ids: Vec<String> = redis::from_redis_value(ids)?;
    Ok((cursor, ids.len()))
}

// ============================================================
// In-process
// ============================================================

/// Publish history kept by [`MemoryTransport`]; oldest entries drop first.
const PUBLISHED_HISTORY: usize = 10_000;

#[derive(Default)]
struct MemoryShared {
    ready: Mutex<HashMap<String, VecDeque<(u64, String)>>>,
    in_flight: Mutex<HashMap<u64, (String, String)>>,
    published: Mutex<VecDeque<(String, String)>>,
    sequence: AtomicU64,
    unavailable: AtomicBool,
    notify: Notify,
}

/// In-process transport with the same partitioning and ack contract.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<MemoryShared>,
    partitions: u32,
    block: Duration,
}

impl MemoryTransport {
    pub fn new(partitions: u32) -> Self {
        Self {
            shared: Arc::new(MemoryShared::default()),
            partitions: partitions.max(1),
            block: Duration::from_millis(50),
        }
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Make every publish fail with a transport error (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The most recent `(key, value)` pairs successfully published, oldest
    /// first.
    pub fn published(&self) -> Vec<(String, String)> {
        self.shared.published.lock().iter().cloned().collect()
    }

    /// Items waiting to be read across all partitions.
    pub fn ready_len(&self) -> usize {
        self.shared.ready.lock().values().map(VecDeque::len).sum()
    }

    pub fn in_flight_len(&self) -> usize {
        self.shared.in_flight.lock().len()
    }

    /// Put every read-but-unacked item back at the head of its stream, as
    /// happens when a consumer dies.
    pub fn requeue_unacked(&self) -> usize {
        let mut in_flight: Vec<(u64, (String, String))> =
            self.shared.in_flight.lock().drain().collect();
        in_flight.sort_by_key(|(seq, _)| std::cmp::Reverse(*seq));

        let count = in_flight.len();
        let mut ready = self.shared.ready.lock();
        for (seq, (stream, value)) in in_flight {
            ready.entry(stream).or_default().push_front((seq, value));
        }
        drop(ready);
        self.shared.notify.notify_waiters();
        count
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, key: &str, value: &str) -> Result<(), AppError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Transport("transport unavailable".to_string()));
        }
        let stream = stream_name(topic, partition_for(key, self.partitions));
        let seq = self.shared.sequence.fetch_add(1, Ordering::SeqCst);
        self.shared
            .ready
            .lock()
            .entry(stream)
            .or_default()
            .push_back((seq, value.to_string()));
        {
            let mut published = self.shared.published.lock();
            if published.len() >= PUBLISHED_HISTORY {
                published.pop_front();
            }
            published.push_back((key.to_string(), value.to_string()));
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        partition: u32,
        _consumer: &str,
    ) -> Result<Box<dyn TransportStream>, AppError> {
        Ok(Box::new(MemoryStream {
            shared: self.shared.clone(),
            stream: stream_name(topic, partition),
            block: self.block,
        }))
    }

    fn partitions(&self) -> u32 {
        self.partitions
    }
}

struct MemoryStream {
    shared: Arc<MemoryShared>,
    stream: String,
    block: Duration,
}

impl MemoryStream {
    fn pop(&self) -> Option<Envelope> {
        let (seq, value) = self.shared.ready.lock().get_mut(&self.stream)?.pop_front()?;
        self.shared
            .in_flight
            .lock()
            .insert(seq, (self.stream.clone(), value.clone()));
        Some(Envelope {
            stream: self.stream.clone(),
            receipt: seq.to_string(),
            value,
        })
    }
}

#[async_trait]
impl TransportStream for MemoryStream {
    async fn next(&mut self) -> Result<Option<Envelope>, AppError> {
        let deadline = tokio::time::Instant::now() + self.block;
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.pop() {
                return Ok(Some(envelope));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, envelope: &Envelope) -> Result<(), AppError> {
        let seq: u64 = envelope
            .receipt
            .parse()
            .map_err(|_| AppError::Transport(format!("bad receipt {}", envelope.receipt)))?;
        self.shared.in_flight.lock().remove(&seq);
        Ok(())
    }
}
