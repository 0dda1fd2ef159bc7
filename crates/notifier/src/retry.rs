//! Retry coordinator.
//!
//! A periodic sweep that keeps PENDING rows moving when no work item will
//! arrive for them on its own:
//! - PROCESSING rows whose claim went stale (crashed worker) are reclaimed
//! - PENDING retries past their `next_retry_at`, and rows whose last
//!   publication is older than the orphan grace period, are republished
//!
//! A store error on one row is logged and counted; the sweep moves on to the
//! next row. Only the two range queries can fail a whole sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_common::config::AppConfig;
use courier_common::error::AppError;
use courier_common::types::WorkItem;
use courier_engine::store::NotificationStore;
use courier_engine::transport::{Transport, publish_work_item};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub topic: String,
    pub interval: Duration,
    /// Upper bound of the random delay added to each sweep.
    pub jitter: Duration,
    pub stale_after: Duration,
    pub orphan_grace: Duration,
    pub batch_size: i64,
}

impl CoordinatorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            topic: config.transport_topic.clone(),
            interval: Duration::from_secs(config.sweep_interval_seconds),
            jitter: Duration::from_millis(config.sweep_jitter_ms),
            stale_after: Duration::from_secs(config.stale_claim_seconds),
            orphan_grace: Duration::from_secs(config.orphan_grace_seconds),
            batch_size: config.sweep_batch_size,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub republished: usize,
    pub publish_failures: usize,
    /// Rows skipped because a per-row store call failed.
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RetryCoordinator {
    store: Arc<dyn NotificationStore>,
    transport: Arc<dyn Transport>,
    settings: CoordinatorSettings,
}

impl RetryCoordinator {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        transport: Arc<dyn Transport>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            store,
            transport,
            settings,
        }
    }

    /// Sweep every `interval` plus jitter until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            "Retry coordinator started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let jitter = self.jitter();
            if !jitter.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(jitter) => {}
                }
            }

            match self.sweep(Utc::now()).await {
                Ok(report) if !report.is_empty() => tracing::info!(
                    reclaimed = report.reclaimed,
                    republished = report.republished,
                    publish_failures = report.publish_failures,
                    errors = report.errors,
                    "Retry sweep finished"
                ),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Retry sweep failed"),
            }
        }

        tracing::info!("Retry coordinator stopped");
    }

    /// One pass: reclaim stale claims, then republish everything due.
    /// Reclaimed rows are republished straight away; a first attempt would
    /// otherwise wait out the orphan grace period again.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let mut report = SweepReport::default();
        let mut published = HashSet::new();

        let cutoff = now - to_chrono(self.settings.stale_after);
        for notification in self.store.stuck(cutoff, self.settings.batch_size).await? {
            match self.store.reclaim(notification.id, cutoff, now).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        notification_id = %notification.id,
                        error = %e,
                        "Reclaim failed, skipping row"
                    );
                    continue;
                }
            }
            report.reclaimed += 1;
            tracing::warn!(
                notification_id = %notification.id,
                claimed_at = ?notification.claimed_at,
                retry_count = notification.retry_count,
                "Reclaimed stale claim"
            );
            if self.republish(notification.id, now, &mut report).await {
                published.insert(notification.id);
            }
        }

        let orphan_cutoff = now - to_chrono(self.settings.orphan_grace);
        let due = self
            .store
            .due_for_retry(now, orphan_cutoff, self.settings.batch_size)
            .await?;
        for notification in due {
            if !published.contains(&notification.id) {
                self.republish(notification.id, now, &mut report).await;
            }
        }

        Ok(report)
    }

    /// Publish a fresh work item and stamp the row so the next sweeps leave
    /// it alone while that item is still queued.
    async fn republish(
        &self,
        notification_id: Uuid,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> bool {
        let item = WorkItem { notification_id };
        if let Err(e) = publish_work_item(self.transport.as_ref(), &self.settings.topic, item).await
        {
            report.publish_failures += 1;
            tracing::warn!(
                notification_id = %notification_id,
                error = %e,
                "Republish failed, will retry next sweep"
            );
            return false;
        }
        report.republished += 1;

        // A lost stamp only means the row may be republished once more.
        if let Err(e) = self.store.mark_published(notification_id, now).await {
            report.errors += 1;
            tracing::warn!(
                notification_id = %notification_id,
                error = %e,
                "Failed to record republish"
            );
        }
        true
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.settings.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
