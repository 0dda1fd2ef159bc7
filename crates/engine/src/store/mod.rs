//! Notification record store.
//!
//! Every mutation is a conditional update on the status the caller observed
//! (`... WHERE id = $1 AND status = 'pending'`). The boolean result says
//! whether this writer won; a `false` is a normal race loss, never an error.

mod memory;
mod postgres;

pub use memory::MemoryNotificationStore;
pub use postgres::PgNotificationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{NewNotification, Notification, Page, PageRequest};

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a new notification at PENDING.
    async fn insert(&self, notification: NewNotification) -> Result<Notification, AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    /// Newest first.
    async fn list_by_recipient(
        &self,
        recipient_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<Notification>, AppError>;

    /// In-app notifications delivered but not yet read.
    async fn count_unread(&self, recipient_id: Uuid) -> Result<i64, AppError>;

    /// PENDING → PROCESSING, only once any backoff has elapsed.
    async fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;

    /// PROCESSING → SENT.
    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;

    /// SENT → DELIVERED.
    async fn mark_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;

    /// PROCESSING → PENDING with a new retry count and due time.
    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// PROCESSING → FAILED.
    async fn mark_failed(
        &self,
        id: Uuid,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// DELIVERED → READ for one in-app notification owned by `recipient_id`.
    async fn mark_read(
        &self,
        id: Uuid,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// DELIVERED → READ for every in-app notification of `recipient_id`.
    async fn mark_all_read(&self, recipient_id: Uuid, now: DateTime<Utc>)
    -> Result<u64, AppError>;

    /// PENDING rows ready to be (re)published: retries whose `next_retry_at`
    /// has passed and that were not republished since, plus rows whose last
    /// publication (or creation) is older than `orphan_cutoff` because the
    /// work item may never have reached a worker. Highest priority first,
    /// then oldest.
    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        orphan_cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError>;

    /// Record a republish of a PENDING row.
    async fn mark_published(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError>;

    /// PROCESSING rows claimed before `cutoff`. Same ordering as above.
    async fn stuck(&self, cutoff: DateTime<Utc>, limit: i64)
    -> Result<Vec<Notification>, AppError>;

    /// PROCESSING → PENDING for a claim older than `cutoff`. Not a failure:
    /// the retry count is untouched and the row is immediately due again.
    async fn reclaim(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;
}

/// Error message recorded on a reclaimed notification.
pub const RECLAIM_MESSAGE: &str = "claim expired; reclaimed by retry coordinator";
