use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{NewNotification, Notification, Page, PageRequest};

use super::{NotificationStore, RECLAIM_MESSAGE};

/// Store backed by the `notifications` table.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn insert(&self, n: NewNotification) -> Result<Notification, AppError> {
        let notification: Notification = sqlx::query_as(
            r#"
            INSERT INTO notifications
                (id, recipient_id, channel, priority, subject, body, metadata, event_id,
                 status, retry_count, max_retries, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 0, $9, $10, $10)
            RETURNING *
            "#,
        )
        .bind(n.id)
        .bind(n.recipient_id)
        .bind(n.channel)
        .bind(n.priority)
        .bind(&n.subject)
        .bind(&n.body)
        .bind(&n.metadata)
        .bind(&n.event_id)
        .bind(n.max_retries)
        .bind(n.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(notification)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let notification: Option<Notification> =
            sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(notification)
    }

    async fn list_by_recipient(
        &self,
        recipient_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<Notification>, AppError> {
        let items: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE recipient_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(recipient_id)
        .bind(i64::from(page.limit()))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE recipient_id = $1")
                .bind(recipient_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(Page {
            items,
            page: page.page,
            size: page.limit(),
            total,
        })
    }

    async fn count_unread(&self, recipient_id: Uuid) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM notifications
            WHERE recipient_id = $1 AND channel = 'in_app' AND status = 'delivered'
            "#,
        )
        .bind(recipient_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'processing', claimed_at = $2, next_retry_at = NULL, updated_at = $2
            WHERE id = $1
              AND status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= $2)
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'sent', sent_at = $2, claimed_at = NULL, error_message = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'delivered', delivered_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'sent'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'pending', retry_count = $2, next_retry_at = $3, error_message = $4,
                claimed_at = NULL, updated_at = $5
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'failed', retry_count = $2, error_message = $3,
                next_retry_at = NULL, claimed_at = NULL, updated_at = $4
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_read(
        &self,
        id: Uuid,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'read', read_at = $3, updated_at = $3
            WHERE id = $1 AND recipient_id = $2 AND channel = 'in_app' AND status = 'delivered'
            "#,
        )
        .bind(id)
        .bind(recipient_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_all_read(
        &self,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'read', read_at = $2, updated_at = $2
            WHERE recipient_id = $1 AND channel = 'in_app' AND status = 'delivered'
            "#,
        )
        .bind(recipient_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        orphan_cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let rows: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE status = 'pending'
              AND ((next_retry_at IS NULL AND COALESCE(published_at, created_at) < $2)
                   OR (next_retry_at <= $1
                       AND (published_at IS NULL
                            OR published_at < next_retry_at
                            OR published_at < $2)))
            ORDER BY priority DESC, created_at ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(orphan_cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn mark_published(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE notifications SET published_at = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let rows: Vec<Notification> = sqlx::query_as(
            r#"
            SELECT * FROM notifications
            WHERE status = 'processing' AND claimed_at < $1
            ORDER BY priority DESC, created_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn reclaim(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'pending',
                claimed_at = NULL,
                next_retry_at = CASE WHEN retry_count > 0 THEN $3 ELSE NULL END,
                error_message = $4,
                updated_at = $3
            WHERE id = $1 AND status = 'processing' AND claimed_at < $2
            "#,
        )
        .bind(id)
        .bind(cutoff)
        .bind(now)
        .bind(RECLAIM_MESSAGE)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
