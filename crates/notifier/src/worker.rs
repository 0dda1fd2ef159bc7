//! Transport consumer: claim, dispatch, record the outcome, acknowledge.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Notification, WorkItem};
use courier_engine::state::{FailureDecision, RetryPolicy};
use courier_engine::store::NotificationStore;
use courier_engine::transport::{Envelope, TransportStream};

use crate::dispatcher::{DeliveryDispatcher, DispatchOutcome};

/// Pause after a transport receive error before polling again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What processing one work item did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Not claimable: another worker has it, it is backing off, or it is
    /// already finished.
    Skipped,
    /// SENT, waiting for an external delivery confirmation.
    Sent,
    /// SENT and immediately DELIVERED.
    Delivered,
    RetryScheduled {
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    },
    Failed {
        retry_count: i32,
    },
}

pub struct Worker {
    name: String,
    store: Arc<dyn NotificationStore>,
    dispatcher: Arc<DeliveryDispatcher>,
    retry_policy: RetryPolicy,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn NotificationStore>,
        dispatcher: Arc<DeliveryDispatcher>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            dispatcher,
            retry_policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume `stream` until `cancel` fires. Cancellation is observed
    /// between receives, which are bounded by the transport block timeout.
    pub async fn run(&self, mut stream: Box<dyn TransportStream>, cancel: CancellationToken) {
        tracing::info!(worker = %self.name, "Worker started");

        while !cancel.is_cancelled() {
            match stream.next().await {
                Ok(Some(envelope)) => self.handle(stream.as_mut(), envelope).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker = %self.name, error = %e, "Transport receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!(worker = %self.name, "Worker stopped");
    }

    /// Process one envelope and acknowledge it once the outcome is persisted.
    /// Items that fail to persist stay unacknowledged; the retry coordinator
    /// recovers their rows.
    pub async fn handle(&self, stream: &mut dyn TransportStream, envelope: Envelope) {
        let item: WorkItem = match serde_json::from_str(&envelope.value) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(
                    worker = %self.name,
                    receipt = %envelope.receipt,
                    error = %e,
                    "Dropping undecodable work item"
                );
                self.ack(stream, &envelope).await;
                return;
            }
        };

        match self.process(item.notification_id).await {
            Ok(_) => self.ack(stream, &envelope).await,
            Err(e) => tracing::error!(
                worker = %self.name,
                notification_id = %item.notification_id,
                error = %e,
                "Failed to record processing outcome"
            ),
        }
    }

    async fn ack(&self, stream: &mut dyn TransportStream, envelope: &Envelope) {
        if let Err(e) = stream.ack(envelope).await {
            tracing::warn!(
                worker = %self.name,
                receipt = %envelope.receipt,
                error = %e,
                "Failed to acknowledge work item"
            );
        }
    }

    /// Claim and deliver one notification.
    pub async fn process(&self, id: Uuid) -> Result<ProcessOutcome, AppError> {
        if !self.store.claim(id, Utc::now()).await? {
            tracing::debug!(worker = %self.name, notification_id = %id, "Claim lost or not due");
            return Ok(ProcessOutcome::Skipped);
        }

        let Some(notification) = self.store.get(id).await? else {
            return Ok(ProcessOutcome::Skipped);
        };

        let outcome = match self.dispatcher.dispatch(&notification).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    worker = %self.name,
                    notification_id = %id,
                    error = %e,
                    "Unexpected error during dispatch"
                );
                DispatchOutcome::Failed(format!("unexpected error: {}", e))
            }
        };

        match outcome {
            DispatchOutcome::Delivered => self.record_success(&notification).await,
            DispatchOutcome::Failed(reason) => self.record_failure(&notification, &reason).await,
        }
    }

    async fn record_success(&self, notification: &Notification) -> Result<ProcessOutcome, AppError> {
        let now = Utc::now();
        if !self.store.mark_sent(notification.id, now).await? {
            // Reclaimed while we were delivering; the next attempt owns it now.
            tracing::warn!(
                worker = %self.name,
                notification_id = %notification.id,
                "Sent after claim expired; outcome not recorded"
            );
            return Ok(ProcessOutcome::Skipped);
        }

        if self.dispatcher.confirms_delivery(notification.channel) {
            tracing::info!(
                notification_id = %notification.id,
                channel = %notification.channel,
                "Notification sent, awaiting delivery confirmation"
            );
            return Ok(ProcessOutcome::Sent);
        }

        self.store.mark_delivered(notification.id, now).await?;
        tracing::info!(
            notification_id = %notification.id,
            channel = %notification.channel,
            attempt = notification.retry_count + 1,
            "Notification delivered"
        );
        Ok(ProcessOutcome::Delivered)
    }

    async fn record_failure(
        &self,
        notification: &Notification,
        reason: &str,
    ) -> Result<ProcessOutcome, AppError> {
        let now = Utc::now();
        match self
            .retry_policy
            .on_failure(notification.retry_count, notification.max_retries, now)
        {
            FailureDecision::Retry {
                retry_count,
                next_retry_at,
            } => {
                if !self
                    .store
                    .schedule_retry(notification.id, retry_count, next_retry_at, reason, now)
                    .await?
                {
                    return Ok(ProcessOutcome::Skipped);
                }
                tracing::warn!(
                    notification_id = %notification.id,
                    channel = %notification.channel,
                    retry_count,
                    max_retries = notification.max_retries,
                    next_retry_at = %next_retry_at,
                    reason,
                    "Delivery failed, retry scheduled"
                );
                Ok(ProcessOutcome::RetryScheduled {
                    retry_count,
                    next_retry_at,
                })
            }
            FailureDecision::Exhausted { retry_count } => {
                if !self
                    .store
                    .mark_failed(notification.id, retry_count, reason, now)
                    .await?
                {
                    return Ok(ProcessOutcome::Skipped);
                }
                tracing::info!(
                    notification_id = %notification.id,
                    channel = %notification.channel,
                    retry_count,
                    reason,
                    "Notification failed permanently"
                );
                Ok(ProcessOutcome::Failed { retry_count })
            }
        }
    }
}
