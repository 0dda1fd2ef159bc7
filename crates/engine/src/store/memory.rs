use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    Channel, NewNotification, Notification, NotificationStatus, Page, PageRequest,
};

use super::{NotificationStore, RECLAIM_MESSAGE};

/// In-memory store with the same conditional-update semantics as Postgres.
///
/// A single mutex guards all rows, so each check-and-write is atomic.
#[derive(Default)]
pub struct MemoryNotificationStore {
    rows: Mutex<HashMap<Uuid, Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Apply `update` to row `id` if `guard` accepts it.
    fn update_if(
        &self,
        id: Uuid,
        guard: impl FnOnce(&Notification) -> bool,
        update: impl FnOnce(&mut Notification),
    ) -> bool {
        let mut rows = self.rows.lock();
        match rows.get_mut(&id) {
            Some(row) if guard(row) => {
                update(row);
                true
            }
            _ => false,
        }
    }

    /// Highest priority first, then oldest.
    fn sort_for_sweep(rows: &mut [Notification]) {
        rows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
    }
}

fn is_unread_in_app(n: &Notification) -> bool {
    n.channel == Channel::InApp && n.status == NotificationStatus::Delivered
}

/// Mirrors the `due_for_retry` predicate of the Postgres store.
fn is_due(n: &Notification, now: DateTime<Utc>, orphan_cutoff: DateTime<Utc>) -> bool {
    match n.next_retry_at {
        Some(at) => {
            at <= now
                && n
                    .published_at
                    .is_none_or(|published| published < at || published < orphan_cutoff)
        }
        None => n.published_at.unwrap_or(n.created_at) < orphan_cutoff,
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn insert(&self, notification: NewNotification) -> Result<Notification, AppError> {
        let row = notification.into_pending();
        let mut rows = self.rows.lock();
        if rows.contains_key(&row.id) {
            return Err(AppError::Internal(format!(
                "Notification {} already exists",
                row.id
            )));
        }
        rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        Ok(self.rows.lock().get(&id).cloned())
    }

    async fn list_by_recipient(
        &self,
        recipient_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<Notification>, AppError> {
        let mut matching: Vec<Notification> = self
            .rows
            .lock()
            .values()
            .filter(|n| n.recipient_id == recipient_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect();

        Ok(Page {
            items,
            page: page.page,
            size: page.limit(),
            total,
        })
    }

    async fn count_unread(&self, recipient_id: Uuid) -> Result<i64, AppError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|n| n.recipient_id == recipient_id && is_unread_in_app(n))
            .count() as i64)
    }

    async fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        Ok(self.update_if(
            id,
            |n| {
                n.status == NotificationStatus::Pending
                    && n.next_retry_at.is_none_or(|due| due <= now)
            },
            |n| {
                n.status = NotificationStatus::Processing;
                n.claimed_at = Some(now);
                n.next_retry_at = None;
                n.updated_at = now;
            },
        ))
    }

    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        Ok(self.update_if(
            id,
            |n| n.status == NotificationStatus::Processing,
            |n| {
                n.status = NotificationStatus::Sent;
                n.sent_at = Some(now);
                n.claimed_at = None;
                n.error_message = None;
                n.updated_at = now;
            },
        ))
    }

    async fn mark_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        Ok(self.update_if(
            id,
            |n| n.status == NotificationStatus::Sent,
            |n| {
                n.status = NotificationStatus::Delivered;
                n.delivered_at = Some(now);
                n.updated_at = now;
            },
        ))
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(self.update_if(
            id,
            |n| n.status == NotificationStatus::Processing,
            |n| {
                n.status = NotificationStatus::Pending;
                n.retry_count = retry_count;
                n.next_retry_at = Some(next_retry_at);
                n.error_message = Some(error.to_string());
                n.claimed_at = None;
                n.updated_at = now;
            },
        ))
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(self.update_if(
            id,
            |n| n.status == NotificationStatus::Processing,
            |n| {
                n.status = NotificationStatus::Failed;
                n.retry_count = retry_count;
                n.error_message = Some(error.to_string());
                n.next_retry_at = None;
                n.claimed_at = None;
                n.updated_at = now;
            },
        ))
    }

    async fn mark_read(
        &self,
        id: Uuid,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(self.update_if(
            id,
            |n| n.recipient_id == recipient_id && is_unread_in_app(n),
            |n| {
                n.status = NotificationStatus::Read;
                n.read_at = Some(now);
                n.updated_at = now;
            },
        ))
    }

    async fn mark_all_read(
        &self,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut rows = self.rows.lock();
        let mut updated = 0;
        for n in rows
            .values_mut()
            .filter(|n| n.recipient_id == recipient_id && is_unread_in_app(n))
        {
            n.status = NotificationStatus::Read;
            n.read_at = Some(now);
            n.updated_at = now;
            updated += 1;
        }
        Ok(updated)
    }

    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        orphan_cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let mut due: Vec<Notification> = self
            .rows
            .lock()
            .values()
            .filter(|n| n.status == NotificationStatus::Pending)
            .filter(|n| is_due(n, now, orphan_cutoff))
            .cloned()
            .collect();
        Self::sort_for_sweep(&mut due);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn mark_published(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        Ok(self.update_if(
            id,
            |n| n.status == NotificationStatus::Pending,
            |n| n.published_at = Some(now),
        ))
    }

    async fn stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        let mut stuck: Vec<Notification> = self
            .rows
            .lock()
            .values()
            .filter(|n| {
                n.status == NotificationStatus::Processing
                    && n.claimed_at.is_some_and(|at| at < cutoff)
            })
            .cloned()
            .collect();
        Self::sort_for_sweep(&mut stuck);
        stuck.truncate(limit.max(0) as usize);
        Ok(stuck)
    }

    async fn reclaim(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        Ok(self.update_if(
            id,
            |n| {
                n.status == NotificationStatus::Processing
                    && n.claimed_at.is_some_and(|at| at < cutoff)
            },
            |n| {
                n.status = NotificationStatus::Pending;
                n.claimed_at = None;
                n.next_retry_at = (n.retry_count > 0).then_some(now);
                n.error_message = Some(RECLAIM_MESSAGE.to_string());
                n.updated_at = now;
            },
        ))
    }
}
