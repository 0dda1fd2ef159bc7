use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Push,
    InApp,
}

impl Channel {
    /// Every channel the dispatcher must have a capability for.
    pub const ALL: [Channel; 4] = [Channel::Email, Channel::Sms, Channel::Push, Channel::InApp];
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Email => write!(f, "email"),
            Channel::Sms => write!(f, "sms"),
            Channel::Push => write!(f, "push"),
            Channel::InApp => write!(f, "in_app"),
        }
    }
}

/// Notification priority. Stored as SMALLINT so retries sort highest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
        }
    }
}

/// Lifecycle status of a notification.
///
/// Legal edges live in `courier_engine::state`; storage writes are always
/// conditioned on the status the writer observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Processing => write!(f, "processing"),
            NotificationStatus::Sent => write!(f, "sent"),
            NotificationStatus::Delivered => write!(f, "delivered"),
            NotificationStatus::Read => write!(f, "read"),
            NotificationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A person (or device owner) notifications are addressed to.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Recipient {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub push_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A persisted notification and its delivery state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub channel: Channel,
    pub priority: Priority,
    pub subject: Option<String>,
    pub body: String,
    pub metadata: serde_json::Value,
    pub event_id: Option<String>,
    pub status: NotificationStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    /// Last time the retry coordinator republished the work item.
    pub published_at: Option<DateTime<Utc>>,
}

/// Fields supplied when a notification row is first written (always PENDING).
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub channel: Channel,
    pub priority: Priority,
    pub subject: Option<String>,
    pub body: String,
    pub metadata: serde_json::Value,
    pub event_id: Option<String>,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

impl NewNotification {
    /// The row as it looks immediately after insertion.
    pub fn into_pending(self) -> Notification {
        Notification {
            id: self.id,
            recipient_id: self.recipient_id,
            channel: self.channel,
            priority: self.priority,
            subject: self.subject,
            body: self.body,
            metadata: self.metadata,
            event_id: self.event_id,
            status: NotificationStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries,
            next_retry_at: None,
            error_message: None,
            claimed_at: None,
            created_at: self.created_at,
            updated_at: self.created_at,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            published_at: None,
        }
    }
}

/// Reference to a template plus the variables to render it with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

/// Client request to notify one recipient.
///
/// Content is either direct (`subject` + `body`) or a `template`; exactly one
/// of `body` and `template` must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipient_id: Uuid,
    pub channel: Channel,
    #[serde(default)]
    pub priority: Priority,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub template: Option<TemplateRef>,
    /// Caller-supplied idempotency key; blank or absent disables dedup.
    pub event_id: Option<String>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Client request to send the same notification to many recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkNotificationRequest {
    pub recipient_ids: Vec<Uuid>,
    pub channel: Channel,
    #[serde(default)]
    pub priority: Priority,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub template: Option<TemplateRef>,
    /// Scoped per recipient as `{event_id}:{recipient_id}`.
    pub event_id: Option<String>,
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl BulkNotificationRequest {
    /// The single-recipient request submitted for `recipient_id`.
    pub fn for_recipient(&self, recipient_id: Uuid) -> NotificationRequest {
        NotificationRequest {
            recipient_id,
            channel: self.channel,
            priority: self.priority,
            subject: self.subject.clone(),
            body: self.body.clone(),
            template: self.template.clone(),
            event_id: self
                .event_id
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(|e| format!("{}:{}", e, recipient_id)),
            max_retries: self.max_retries,
            metadata: self.metadata.clone(),
        }
    }
}

/// Handle returned to the caller once a notification is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRef {
    pub id: Uuid,
    pub status: NotificationStatus,
}

/// Outcome of a single submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Created(NotificationRef),
    /// The event id was already processed; no row was created.
    Duplicate { event_id: String },
}

/// Why one recipient of a bulk submission was not notified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFailure {
    pub recipient_id: Uuid,
    pub kind: String,
    pub reason: String,
    pub retry_after_seconds: Option<u64>,
}

/// Result of a bulk submission, split by outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkResult {
    pub notification_ids: Vec<Uuid>,
    pub duplicates: Vec<Uuid>,
    pub failures: Vec<BulkFailure>,
}

/// Minimal work item published to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub notification_id: Uuid,
}

/// Page request for per-recipient listings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "PageRequest::default_size")]
    pub size: u32,
}

impl PageRequest {
    pub const MAX_SIZE: u32 = 100;

    fn default_size() -> u32 {
        20
    }

    /// Page size clamped to `1..=MAX_SIZE`.
    pub fn limit(&self) -> u32 {
        self.size.clamp(1, Self::MAX_SIZE)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page) * u64::from(self.limit())
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            size: Self::default_size(),
        }
    }
}

/// One page of results plus the total row count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: i64,
}
