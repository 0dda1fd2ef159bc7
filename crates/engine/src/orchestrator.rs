//! Submission path and query surface.
//!
//! `submit` runs the request through:
//! 1. Recipient lookup (`NotFound`)
//! 2. Event-id dedup (`Duplicate`, no row)
//! 3. Quota (`RateLimited`)
//! 4. Content resolution, direct or via template
//! 5. Persist at PENDING
//! 6. Publish the work item. A publish failure is logged and swallowed: the
//!    row is already durable and the retry coordinator republishes it.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    BulkFailure, BulkNotificationRequest, BulkResult, Channel, NewNotification, Notification,
    NotificationRef, NotificationRequest, NotificationStatus, Page, PageRequest, SubmitOutcome,
    WorkItem,
};

use crate::dedup::DedupStore;
use crate::quota::{QuotaDecision, QuotaTracker};
use crate::recipient::RecipientDirectory;
use crate::state::RetryPolicy;
use crate::store::NotificationStore;
use crate::template::TemplateEngine;
use crate::transport::{Transport, publish_work_item};

const MAX_SUBJECT_CHARS: usize = 255;
const MAX_BODY_CHARS: usize = 10_000;
const MAX_BULK_RECIPIENTS: usize = 1_000;

/// Resolved subject and body of a request.
struct Content {
    subject: Option<String>,
    body: String,
}

/// Entry point for creating and querying notifications.
pub struct Orchestrator {
    directory: Arc<dyn RecipientDirectory>,
    templates: Arc<dyn TemplateEngine>,
    dedup: DedupStore,
    quota: QuotaTracker,
    store: Arc<dyn NotificationStore>,
    transport: Arc<dyn Transport>,
    topic: String,
    retry_policy: RetryPolicy,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: Arc<dyn RecipientDirectory>,
        templates: Arc<dyn TemplateEngine>,
        dedup: DedupStore,
        quota: QuotaTracker,
        store: Arc<dyn NotificationStore>,
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            directory,
            templates,
            dedup,
            quota,
            store,
            transport,
            topic: topic.into(),
            retry_policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Accept one notification request.
    pub async fn submit(&self, request: NotificationRequest) -> Result<SubmitOutcome, AppError> {
        Self::validate(
            request.body.as_deref(),
            request.subject.as_deref(),
            request.template.is_some(),
            request.max_retries,
        )?;

        // (a) Recipient must exist
        if self.directory.find_by_id(request.recipient_id).await?.is_none() {
            return Err(AppError::NotFound(format!(
                "Recipient {} not found",
                request.recipient_id
            )));
        }

        // (b) Dedup on event id
        let event_id = request
            .event_id
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        if self.dedup.is_duplicate(event_id.as_deref()).await? {
            return Ok(SubmitOutcome::Duplicate {
                event_id: event_id.unwrap_or_default(),
            });
        }

        // (c)-(e) Quota, content, persist. The event id is released if any of
        // these fail so the caller can retry it.
        let notification = match self.admit(&request, event_id.clone()).await {
            Ok(notification) => notification,
            Err(e) => {
                if let Err(release_err) = self.dedup.release(event_id.as_deref()).await {
                    tracing::warn!(
                        event_id = ?event_id,
                        error = %release_err,
                        "Failed to release event id after rejected submission"
                    );
                }
                return Err(e);
            }
        };

        // (f) Publish; the row is durable either way
        self.publish(notification.id).await;

        tracing::info!(
            notification_id = %notification.id,
            recipient_id = %notification.recipient_id,
            channel = %notification.channel,
            priority = %notification.priority,
            "Notification accepted"
        );

        Ok(SubmitOutcome::Created(NotificationRef {
            id: notification.id,
            status: notification.status,
        }))
    }

    /// Submit the same content to many recipients. Per-recipient failures are
    /// collected and never abort the batch.
    pub async fn submit_bulk(&self, request: BulkNotificationRequest) -> Result<BulkResult, AppError> {
        if request.recipient_ids.is_empty() {
            return Err(AppError::InvalidRequest(
                "recipient_ids must not be empty".to_string(),
            ));
        }
        if request.recipient_ids.len() > MAX_BULK_RECIPIENTS {
            return Err(AppError::InvalidRequest(format!(
                "At most {} recipients per bulk request",
                MAX_BULK_RECIPIENTS
            )));
        }
        Self::validate(
            request.body.as_deref(),
            request.subject.as_deref(),
            request.template.is_some(),
            request.max_retries,
        )?;

        let mut result = BulkResult::default();
        for &recipient_id in &request.recipient_ids {
            match self.submit(request.for_recipient(recipient_id)).await {
                Ok(SubmitOutcome::Created(reference)) => result.notification_ids.push(reference.id),
                Ok(SubmitOutcome::Duplicate { .. }) => result.duplicates.push(recipient_id),
                Err(e) => {
                    tracing::debug!(recipient_id = %recipient_id, error = %e, "Bulk entry rejected");
                    let retry_after_seconds = match &e {
                        AppError::RateLimited {
                            retry_after_seconds,
                            ..
                        } => Some(*retry_after_seconds),
                        _ => None,
                    };
                    result.failures.push(BulkFailure {
                        recipient_id,
                        kind: e.kind().to_string(),
                        reason: e.to_string(),
                        retry_after_seconds,
                    });
                }
            }
        }

        tracing::info!(
            requested = request.recipient_ids.len(),
            created = result.notification_ids.len(),
            duplicates = result.duplicates.len(),
            failed = result.failures.len(),
            channel = %request.channel,
            "Bulk submission processed"
        );

        Ok(result)
    }

    pub async fn get(&self, id: Uuid) -> Result<Notification, AppError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    pub async fn list_by_recipient(
        &self,
        recipient_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<Notification>, AppError> {
        self.store.list_by_recipient(recipient_id, page).await
    }

    pub async fn unread_count(&self, recipient_id: Uuid) -> Result<i64, AppError> {
        self.store.count_unread(recipient_id).await
    }

    /// Mark one in-app notification as read. Reading twice is a no-op.
    pub async fn mark_read(&self, recipient_id: Uuid, id: Uuid) -> Result<Notification, AppError> {
        let current = self.get(id).await?;
        if current.recipient_id != recipient_id {
            return Err(AppError::NotFound(format!("Notification {} not found", id)));
        }
        if current.status == NotificationStatus::Read {
            return Ok(current);
        }
        if current.channel != Channel::InApp {
            return Err(AppError::InvalidRequest(format!(
                "Only in-app notifications can be marked read ({} is {})",
                id, current.channel
            )));
        }

        if !self.store.mark_read(id, recipient_id, Utc::now()).await? {
            let latest = self.get(id).await?;
            // Lost to a concurrent mark_read / mark_all_read.
            if latest.status == NotificationStatus::Read {
                return Ok(latest);
            }
            return Err(AppError::InvalidRequest(format!(
                "Notification {} is {} and cannot be marked read yet",
                id, latest.status
            )));
        }

        self.get(id).await
    }

    /// Mark every delivered in-app notification of a recipient as read.
    pub async fn mark_all_read(&self, recipient_id: Uuid) -> Result<u64, AppError> {
        let updated = self.store.mark_all_read(recipient_id, Utc::now()).await?;
        tracing::debug!(recipient_id = %recipient_id, updated, "Marked all read");
        Ok(updated)
    }

    /// External delivery confirmation (SENT → DELIVERED). Idempotent.
    pub async fn confirm_delivery(&self, id: Uuid) -> Result<Notification, AppError> {
        let current = self.get(id).await?;
        match current.status {
            NotificationStatus::Delivered | NotificationStatus::Read => Ok(current),
            NotificationStatus::Sent => {
                if self.store.mark_delivered(id, Utc::now()).await? {
                    tracing::info!(notification_id = %id, "Delivery confirmed");
                }
                self.get(id).await
            }
            status => Err(AppError::InvalidRequest(format!(
                "Notification {} is {} and cannot be confirmed",
                id, status
            ))),
        }
    }

    /// Quota, content and persistence for a request that passed dedup.
    async fn admit(
        &self,
        request: &NotificationRequest,
        event_id: Option<String>,
    ) -> Result<Notification, AppError> {
        match self
            .quota
            .check_and_consume(request.recipient_id, request.channel)
            .await?
        {
            QuotaDecision::Allowed { .. } => {}
            QuotaDecision::Denied {
                limit,
                retry_after_seconds,
            } => {
                return Err(AppError::RateLimited {
                    channel: request.channel,
                    limit,
                    retry_after_seconds,
                });
            }
        }

        let inserted = self.persist(request, event_id).await;
        if let Err(e) = &inserted {
            if let Err(refund_err) = self
                .quota
                .refund(request.recipient_id, request.channel)
                .await
            {
                tracing::warn!(
                    recipient_id = %request.recipient_id,
                    channel = %request.channel,
                    error = %refund_err,
                    cause = %e,
                    "Failed to refund quota"
                );
            }
        }
        inserted
    }

    /// Content resolution and the PENDING insert.
    async fn persist(
        &self,
        request: &NotificationRequest,
        event_id: Option<String>,
    ) -> Result<Notification, AppError> {
        let content = self.resolve_content(request).await?;
        let max_retries = request
            .max_retries
            .unwrap_or(self.retry_policy.default_max_retries)
            .min(RetryPolicy::MAX_RETRIES_LIMIT);

        self.store
            .insert(NewNotification {
                id: Uuid::new_v4(),
                recipient_id: request.recipient_id,
                channel: request.channel,
                priority: request.priority,
                subject: content.subject,
                body: content.body,
                metadata: match &request.metadata {
                    serde_json::Value::Null => serde_json::json!({}),
                    other => other.clone(),
                },
                event_id,
                max_retries: max_retries as i32,
                created_at: Utc::now(),
            })
            .await
    }

    async fn resolve_content(&self, request: &NotificationRequest) -> Result<Content, AppError> {
        let Some(template) = &request.template else {
            return Ok(Content {
                subject: request.subject.clone(),
                body: request.body.clone().unwrap_or_default(),
            });
        };

        let rendered = self
            .templates
            .render(&template.name, &template.variables)
            .await?;
        if rendered.channel != request.channel {
            return Err(AppError::ChannelMismatch {
                template: template.name.clone(),
                expected: request.channel,
                actual: rendered.channel,
            });
        }

        Ok(Content {
            subject: request.subject.clone().or(rendered.subject),
            body: rendered.body,
        })
    }

    async fn publish(&self, notification_id: Uuid) {
        let item = WorkItem { notification_id };
        if let Err(e) = publish_work_item(self.transport.as_ref(), &self.topic, item).await {
            tracing::warn!(
                notification_id = %notification_id,
                error = %e,
                "Work item publish failed; notification stays pending for the retry coordinator"
            );
        }
    }

    fn validate(
        body: Option<&str>,
        subject: Option<&str>,
        has_template: bool,
        max_retries: Option<u32>,
    ) -> Result<(), AppError> {
        match (body, has_template) {
            (Some(_), true) => {
                return Err(AppError::InvalidRequest(
                    "Provide either body or template, not both".to_string(),
                ));
            }
            (None, false) => {
                return Err(AppError::InvalidRequest(
                    "Either body or template is required".to_string(),
                ));
            }
            (Some(body), false) if body.trim().is_empty() => {
                return Err(AppError::InvalidRequest("body must not be blank".to_string()));
            }
            (Some(body), false) if body.chars().count() > MAX_BODY_CHARS => {
                return Err(AppError::InvalidRequest(format!(
                    "body exceeds {} characters",
                    MAX_BODY_CHARS
                )));
            }
            _ => {}
        }

        if subject.is_some_and(|s| s.chars().count() > MAX_SUBJECT_CHARS) {
            return Err(AppError::InvalidRequest(format!(
                "subject exceeds {} characters",
                MAX_SUBJECT_CHARS
            )));
        }

        if max_retries.is_some_and(|m| m > RetryPolicy::MAX_RETRIES_LIMIT) {
            return Err(AppError::InvalidRequest(format!(
                "max_retries must be at most {}",
                RetryPolicy::MAX_RETRIES_LIMIT
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_exactly_one_content_source() {
        assert!(Orchestrator::validate(Some("hi"), None, false, None).is_ok());
        assert!(Orchestrator::validate(None, None, true, None).is_ok());
        assert!(Orchestrator::validate(None, None, false, None).is_err());
        assert!(Orchestrator::validate(Some("hi"), None, true, None).is_err());
        assert!(Orchestrator::validate(Some("  "), None, false, None).is_err());
    }

    #[test]
    fn test_validate_limits() {
        let long_body = "x".repeat(MAX_BODY_CHARS + 1);
        let long_subject = "s".repeat(MAX_SUBJECT_CHARS + 1);
        assert!(Orchestrator::validate(Some(&long_body), None, false, None).is_err());
        assert!(Orchestrator::validate(Some("hi"), Some(&long_subject), false, None).is_err());
        assert!(Orchestrator::validate(Some("hi"), None, false, Some(11)).is_err());
        assert!(Orchestrator::validate(Some("hi"), None, false, Some(10)).is_ok());
    }
}
