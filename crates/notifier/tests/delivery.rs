//! Delivery scenarios against in-memory backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    Channel, NewNotification, Notification, NotificationStatus, Page, PageRequest, Priority,
    Recipient, WorkItem,
};
use courier_engine::recipient::{MemoryRecipientDirectory, RecipientDirectory};
use courier_engine::state::RetryPolicy;
use courier_engine::store::{MemoryNotificationStore, NotificationStore, RECLAIM_MESSAGE};
use courier_engine::transport::{MemoryTransport, Transport, publish_work_item};
use courier_notifier::channels::{
    DeliveryChannel, EmailChannel, GatewayClient, InAppChannel, PushChannel, SmsChannel,
};
use courier_notifier::dispatcher::DeliveryDispatcher;
use courier_notifier::error::DeliveryError;
use courier_notifier::retry::{CoordinatorSettings, RetryCoordinator};
use courier_notifier::worker::{ProcessOutcome, Worker};

const TOPIC: &str = "notifications";

/// Email capability that fails a fixed number of times before succeeding.
struct FlakyEmail {
    failures_left: AtomicUsize,
    sends: AtomicUsize,
    confirms: bool,
}

impl FlakyEmail {
    fn new(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            sends: AtomicUsize::new(0),
            confirms: false,
        }
    }
}

#[async_trait]
impl DeliveryChannel for FlakyEmail {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn can_handle(&self, notification: &Notification, recipient: &Recipient) -> bool {
        notification.channel == Channel::Email && recipient.email.is_some()
    }

    async fn send(&self, _: &Notification, _: &Recipient) -> Result<(), DeliveryError> {
        let attempt = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(DeliveryError::Gateway {
                status: 500 + attempt as u16,
            });
        }
        Ok(())
    }

    fn confirms_delivery(&self) -> bool {
        self.confirms
    }
}

/// Directory whose backend is down.
struct BrokenDirectory;

#[async_trait]
impl RecipientDirectory for BrokenDirectory {
    async fn find_by_id(&self, _: Uuid) -> Result<Option<Recipient>, AppError> {
        Err(AppError::Internal("directory unavailable".to_string()))
    }
}

/// Memory store whose `reclaim` errors for one row, like a row-level lock
/// timeout in Postgres.
struct ReclaimFailsFor {
    inner: Arc<MemoryNotificationStore>,
    failing: Uuid,
}

#[async_trait]
impl NotificationStore for ReclaimFailsFor {
    async fn insert(&self, n: NewNotification) -> Result<Notification, AppError> {
        self.inner.insert(n).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        self.inner.get(id).await
    }

    async fn list_by_recipient(
        &self,
        recipient_id: Uuid,
        page: PageRequest,
    ) -> Result<Page<Notification>, AppError> {
        self.inner.list_by_recipient(recipient_id, page).await
    }

    async fn count_unread(&self, recipient_id: Uuid) -> Result<i64, AppError> {
        self.inner.count_unread(recipient_id).await
    }

    async fn claim(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.inner.claim(id, now).await
    }

    async fn mark_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.inner.mark_sent(id, now).await
    }

    async fn mark_delivered(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.inner.mark_delivered(id, now).await
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.inner
            .schedule_retry(id, retry_count, next_retry_at, error, now)
            .await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        retry_count: i32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.inner.mark_failed(id, retry_count, error, now).await
    }

    async fn mark_read(
        &self,
        id: Uuid,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.inner.mark_read(id, recipient_id, now).await
    }

    async fn mark_all_read(&self, recipient_id: Uuid, now: DateTime<Utc>) -> Result<u64, AppError> {
        self.inner.mark_all_read(recipient_id, now).await
    }

    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        orphan_cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>, AppError> {
        self.inner.due_for_retry(now, orphan_cutoff, limit).await
    }

    async fn mark_published(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.inner.mark_published(id, now).await
    }

    async fn stuck(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>, AppError> {
        self.inner.stuck(cutoff, limit).await
    }

    async fn reclaim(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        if id == self.failing {
            return Err(AppError::Internal("row lock timeout".to_string()));
        }
        self.inner.reclaim(id, cutoff, now).await
    }
}

struct Harness {
    store: Arc<MemoryNotificationStore>,
    directory: Arc<MemoryRecipientDirectory>,
    transport: MemoryTransport,
    email: Arc<FlakyEmail>,
    dispatcher: Arc<DeliveryDispatcher>,
}

impl Harness {
    fn new(email: FlakyEmail) -> Self {
        let store = Arc::new(MemoryNotificationStore::new());
        let directory = Arc::new(MemoryRecipientDirectory::new());
        let email = Arc::new(email);
        let dispatcher = Arc::new(
            DeliveryDispatcher::new(
                vec![
                    email.clone() as Arc<dyn DeliveryChannel>,
                    Arc::new(SmsChannel::new(GatewayClient::log_only())),
                    Arc::new(PushChannel::new(GatewayClient::log_only())),
                    Arc::new(InAppChannel),
                ],
                directory.clone(),
            )
            .unwrap(),
        );

        Self {
            store,
            directory,
            transport: MemoryTransport::new(2).with_block(Duration::from_millis(20)),
            email,
            dispatcher,
        }
    }

    /// Backoff of zero so a scheduled retry is claimable immediately.
    fn worker(&self, name: &str) -> Worker {
        Worker::new(
            name,
            self.store.clone(),
            self.dispatcher.clone(),
            RetryPolicy::new(Duration::ZERO, Duration::ZERO, 3),
        )
    }

    fn coordinator(&self) -> RetryCoordinator {
        self.coordinator_over(self.store.clone())
    }

    fn coordinator_over(&self, store: Arc<dyn NotificationStore>) -> RetryCoordinator {
        RetryCoordinator::new(
            store,
            Arc::new(self.transport.clone()),
            CoordinatorSettings {
                topic: TOPIC.to_string(),
                interval: Duration::from_secs(30),
                jitter: Duration::ZERO,
                stale_after: Duration::from_secs(300),
                orphan_grace: Duration::from_secs(60),
                batch_size: 100,
            },
        )
    }

    fn recipient(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.directory.insert(Recipient {
            id,
            display_name: Some("Grace".to_string()),
            email: Some("grace@example.com".to_string()),
            phone: None,
            push_token: None,
            created_at: Utc::now(),
        });
        id
    }

    async fn pending(&self, channel: Channel, max_retries: i32) -> Notification {
        self.pending_at(channel, Priority::Normal, max_retries, Utc::now())
            .await
    }

    async fn pending_at(
        &self,
        channel: Channel,
        priority: Priority,
        max_retries: i32,
        created_at: DateTime<Utc>,
    ) -> Notification {
        let recipient_id = self.recipient();
        self.store
            .insert(NewNotification {
                id: Uuid::new_v4(),
                recipient_id,
                channel,
                priority,
                subject: Some("Receipt".to_string()),
                body: "Thanks for your order".to_string(),
                metadata: serde_json::json!({}),
                event_id: None,
                max_retries,
                created_at,
            })
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_success_marks_delivered() {
    let h = Harness::new(FlakyEmail::new(0));
    let n = h.pending(Channel::Email, 3).await;

    let outcome = h.worker("w1").process(n.id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Delivered);

    let stored = h.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Delivered);
    assert!(stored.sent_at.is_some());
    assert!(stored.delivered_at.is_some());
    assert!(stored.claimed_at.is_none());
}

#[tokio::test]
async fn test_three_failures_exhaust_budget() {
    let h = Harness::new(FlakyEmail::new(usize::MAX));
    let n = h.pending(Channel::Email, 3).await;
    let worker = h.worker("w1");

    let first = worker.process(n.id).await.unwrap();
    assert!(matches!(
        first,
        ProcessOutcome::RetryScheduled { retry_count: 1, .. }
    ));
    let second = worker.process(n.id).await.unwrap();
    assert!(matches!(
        second,
        ProcessOutcome::RetryScheduled { retry_count: 2, .. }
    ));
    let third = worker.process(n.id).await.unwrap();
    assert_eq!(third, ProcessOutcome::Failed { retry_count: 3 });

    let stored = h.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Failed);
    assert_eq!(stored.retry_count, 3);
    assert_eq!(
        stored.error_message.as_deref(),
        Some("Gateway returned HTTP 503")
    );

    // FAILED is terminal
    assert_eq!(
        worker.process(n.id).await.unwrap(),
        ProcessOutcome::Skipped
    );
    assert_eq!(h.email.sends.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_then_success() {
    let h = Harness::new(FlakyEmail::new(1));
    let n = h.pending(Channel::Email, 3).await;
    let worker = h.worker("w1");

    assert!(matches!(
        worker.process(n.id).await.unwrap(),
        ProcessOutcome::RetryScheduled { .. }
    ));
    assert_eq!(
        worker.process(n.id).await.unwrap(),
        ProcessOutcome::Delivered
    );

    let stored = h.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, 1);
    assert!(stored.error_message.is_none());
}

#[tokio::test]
async fn test_backoff_blocks_early_redelivery() {
    let h = Harness::new(FlakyEmail::new(1));
    let n = h.pending(Channel::Email, 3).await;
    let worker = Worker::new(
        "w1",
        h.store.clone(),
        h.dispatcher.clone(),
        RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(3600), 3),
    );

    assert!(matches!(
        worker.process(n.id).await.unwrap(),
        ProcessOutcome::RetryScheduled { .. }
    ));
    assert_eq!(
        worker.process(n.id).await.unwrap(),
        ProcessOutcome::Skipped
    );
    assert_eq!(h.email.sends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_two_workers_race_one_winner() {
    let h = Harness::new(FlakyEmail::new(0));
    let n = h.pending(Channel::Email, 3).await;
    let (a, b) = (h.worker("a"), h.worker("b"));

    let (ra, rb) = tokio::join!(a.process(n.id), b.process(n.id));
    let outcomes = [ra.unwrap(), rb.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == ProcessOutcome::Delivered)
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == ProcessOutcome::Skipped)
            .count(),
        1
    );
    assert_eq!(h.email.sends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_redelivered_item_is_noop() {
    let h = Harness::new(FlakyEmail::new(0));
    let n = h.pending(Channel::InApp, 3).await;
    let worker = h.worker("w1");

    assert_eq!(
        worker.process(n.id).await.unwrap(),
        ProcessOutcome::Delivered
    );
    assert_eq!(
        worker.process(n.id).await.unwrap(),
        ProcessOutcome::Skipped
    );
}

#[tokio::test]
async fn test_confirming_channel_stops_at_sent() {
    let mut email = FlakyEmail::new(0);
    email.confirms = true;
    let h = Harness::new(email);
    let n = h.pending(Channel::Email, 3).await;

    assert_eq!(
        h.worker("w1").process(n.id).await.unwrap(),
        ProcessOutcome::Sent
    );
    let stored = h.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Sent);
    assert!(stored.delivered_at.is_none());
}

#[tokio::test]
async fn test_unexpected_dispatch_error_recorded_as_retry() {
    let h = Harness::new(FlakyEmail::new(0));
    let n = h.pending(Channel::InApp, 3).await;
    let dispatcher = Arc::new(
        DeliveryDispatcher::new(
            vec![
                Arc::new(EmailChannel::new(GatewayClient::log_only())),
                Arc::new(SmsChannel::new(GatewayClient::log_only())),
                Arc::new(PushChannel::new(GatewayClient::log_only())),
                Arc::new(InAppChannel),
            ],
            Arc::new(BrokenDirectory),
        )
        .unwrap(),
    );
    let worker = Worker::new("w1", h.store.clone(), dispatcher, RetryPolicy::default());

    let outcome = worker.process(n.id).await.unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::RetryScheduled { retry_count: 1, .. }
    ));

    let stored = h.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Pending);
    assert!(
        stored
            .error_message
            .unwrap()
            .contains("directory unavailable")
    );
}

#[tokio::test]
async fn test_missing_address_retries_with_reason() {
    let h = Harness::new(FlakyEmail::new(0));
    let n = h.pending(Channel::Sms, 1).await;

    let outcome = h.worker("w1").process(n.id).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Failed { retry_count: 1 });

    let stored = h.store.get(n.id).await.unwrap().unwrap();
    assert!(stored.error_message.unwrap().contains("cannot receive sms"));
}

#[tokio::test]
async fn test_stuck_claim_reclaimed_once() {
    let h = Harness::new(FlakyEmail::new(0));
    let n = h.pending(Channel::Email, 3).await;
    let now = Utc::now();
    assert!(
        h.store
            .claim(n.id, now - chrono::Duration::minutes(10))
            .await
            .unwrap()
    );

    let coordinator = h.coordinator();
    let (a, b) = tokio::join!(coordinator.sweep(now), coordinator.sweep(now));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.reclaimed + b.reclaimed, 1);

    let stored = h.store.get(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, NotificationStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.error_message.as_deref(), Some(RECLAIM_MESSAGE));

    // The reclaimed row is republished and deliverable again
    assert!(
        h.transport
            .published()
            .iter()
            .any(|(key, _)| *key == n.id.to_string())
    );
    assert_eq!(
        h.worker("w2").process(n.id).await.unwrap(),
        ProcessOutcome::Delivered
    );
}

#[tokio::test]
async fn test_late_worker_loses_to_reclaim() {
    let h = Harness::new(FlakyEmail::new(0));
    let n = h.pending(Channel::Email, 3).await;
    let now = Utc::now();
    h.store
        .claim(n.id, now - chrono::Duration::minutes(10))
        .await
        .unwrap();
    h.coordinator().sweep(now).await.unwrap();

    // The original worker finishing now finds the row no longer PROCESSING
    assert!(!h.store.mark_sent(n.id, Utc::now()).await.unwrap());
}

#[tokio::test]
async fn test_sweep_republishes_due_retries_and_orphans() {
    let h = Harness::new(FlakyEmail::new(1));
    let now = Utc::now();

    // Orphan: first attempt whose publish never happened
    let recipient_id = h.recipient();
    let orphan = h
        .store
        .insert(NewNotification {
            id: Uuid::new_v4(),
            recipient_id,
            channel: Channel::Email,
            priority: Priority::Low,
            subject: None,
            body: "orphan".to_string(),
            metadata: serde_json::json!({}),
            event_id: None,
            max_retries: 3,
            created_at: now - chrono::Duration::minutes(5),
        })
        .await
        .unwrap();

    // Due retry
    let retry = h.pending(Channel::Email, 3).await;
    h.worker("w1").process(retry.id).await.unwrap();

    // Fresh first attempt, still inside the grace period
    let fresh = h.pending(Channel::InApp, 3).await;

    let report = h.coordinator().sweep(Utc::now()).await.unwrap();
    assert_eq!(report.republished, 2);
    assert_eq!(report.reclaimed, 0);

    let keys: Vec<String> = h.transport.published().into_iter().map(|(k, _)| k).collect();
    assert!(keys.contains(&orphan.id.to_string()));
    assert!(keys.contains(&retry.id.to_string()));
    assert!(!keys.contains(&fresh.id.to_string()));
}

#[tokio::test]
async fn test_failing_row_does_not_halt_sweep() {
    let h = Harness::new(FlakyEmail::new(0));
    let now = Utc::now();
    let long_ago = now - chrono::Duration::minutes(10);

    // Urgent sorts first in the stuck query; its reclaim errors
    let bad = h.pending_at(Channel::Email, Priority::Urgent, 3, long_ago).await;
    let good = h.pending_at(Channel::Email, Priority::Low, 3, long_ago).await;
    for id in [bad.id, good.id] {
        assert!(h.store.claim(id, long_ago).await.unwrap());
    }
    let orphan = h.pending_at(Channel::InApp, Priority::Normal, 3, long_ago).await;

    let store = Arc::new(ReclaimFailsFor {
        inner: h.store.clone(),
        failing: bad.id,
    });
    let report = h.coordinator_over(store).sweep(now).await.unwrap();

    assert_eq!(report.errors, 1);
    assert_eq!(report.reclaimed, 1);
    assert_eq!(
        h.store.get(good.id).await.unwrap().unwrap().status,
        NotificationStatus::Pending
    );
    assert_eq!(
        h.store.get(bad.id).await.unwrap().unwrap().status,
        NotificationStatus::Processing
    );

    let keys: Vec<String> = h.transport.published().into_iter().map(|(k, _)| k).collect();
    assert!(keys.contains(&good.id.to_string()));
    assert!(keys.contains(&orphan.id.to_string()));
    assert!(!keys.contains(&bad.id.to_string()));
}

#[tokio::test]
async fn test_republished_rows_wait_out_grace_period() {
    let h = Harness::new(FlakyEmail::new(1));
    let now = Utc::now();

    let orphan = h
        .pending_at(Channel::Email, Priority::Normal, 3, now - chrono::Duration::minutes(5))
        .await;
    let retry = h.pending(Channel::Email, 3).await;
    h.worker("w1").process(retry.id).await.unwrap();

    let coordinator = h.coordinator();
    let sweep_at = Utc::now();
    assert_eq!(coordinator.sweep(sweep_at).await.unwrap().republished, 2);
    assert!(
        h.store
            .get(orphan.id)
            .await
            .unwrap()
            .unwrap()
            .published_at
            .is_some()
    );

    // Both work items are still queued; the next tick adds nothing
    let next_tick = sweep_at + chrono::Duration::seconds(30);
    assert!(coordinator.sweep(next_tick).await.unwrap().is_empty());

    // Still unclaimed after the grace period: published again
    let later = sweep_at + chrono::Duration::seconds(61);
    assert_eq!(coordinator.sweep(later).await.unwrap().republished, 2);
    assert_eq!(h.transport.published().len(), 4);
}

#[tokio::test]
async fn test_sweep_counts_publish_failures() {
    let h = Harness::new(FlakyEmail::new(1));
    let retry = h.pending(Channel::Email, 3).await;
    h.worker("w1").process(retry.id).await.unwrap();
    h.transport.set_unavailable(true);

    let report = h.coordinator().sweep(Utc::now()).await.unwrap();
    assert_eq!(report.publish_failures, 1);
    assert_eq!(report.republished, 0);
}

#[tokio::test]
async fn test_run_loop_processes_and_acks() {
    let h = Harness::new(FlakyEmail::new(0));
    let first = h.pending(Channel::Email, 3).await;
    let second = h.pending(Channel::InApp, 3).await;

    let transport: Arc<dyn Transport> = Arc::new(h.transport.clone());
    for n in [&first, &second] {
        publish_work_item(
            transport.as_ref(),
            TOPIC,
            WorkItem {
                notification_id: n.id,
            },
        )
        .await
        .unwrap();
    }
    // A garbage item is dropped, not retried forever
    transport.publish(TOPIC, "junk", "not json").await.unwrap();

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    for partition in 0..transport.partitions() {
        let stream = transport
            .subscribe(TOPIC, partition, &format!("w{}", partition))
            .await
            .unwrap();
        let worker = h.worker(&format!("w{}", partition));
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { worker.run(stream, cancel).await }));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let a = h.store.get(first.id).await.unwrap().unwrap().status;
        let b = h.store.get(second.id).await.unwrap().unwrap().status;
        if a == NotificationStatus::Delivered
            && b == NotificationStatus::Delivered
            && h.transport.ready_len() == 0
            && h.transport.in_flight_len() == 0
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workers did not drain the transport"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_unacked_items_redelivered_after_requeue() {
    let h = Harness::new(FlakyEmail::new(0));
    let n = h.pending(Channel::Email, 3).await;
    let transport: Arc<dyn Transport> = Arc::new(h.transport.clone());
    publish_work_item(
        transport.as_ref(),
        TOPIC,
        WorkItem {
            notification_id: n.id,
        },
    )
    .await
    .unwrap();

    let partition = courier_engine::transport::partition_for(&n.id.to_string(), 2);
    let mut stream = transport.subscribe(TOPIC, partition, "crashy").await.unwrap();

    // Consumer reads, then dies before processing
    let envelope = stream.next().await.unwrap().unwrap();
    drop(stream);
    assert_eq!(h.transport.requeue_unacked(), 1);

    let mut stream = transport.subscribe(TOPIC, partition, "fresh").await.unwrap();
    let redelivered = stream.next().await.unwrap().unwrap();
    assert_eq!(redelivered.value, envelope.value);

    h.worker("fresh").handle(stream.as_mut(), redelivered).await;
    assert_eq!(
        h.store.get(n.id).await.unwrap().unwrap().status,
        NotificationStatus::Delivered
    );
    assert_eq!(h.transport.in_flight_len(), 0);
}
