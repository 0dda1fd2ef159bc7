use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::db;
use courier_engine::recipient::{PgRecipientDirectory, RecipientDirectory};
use courier_engine::state::RetryPolicy;
use courier_engine::store::{NotificationStore, PgNotificationStore};
use courier_engine::transport::{RedisStreamTransport, Transport};
use courier_notifier::channels;
use courier_notifier::dispatcher::DeliveryDispatcher;
use courier_notifier::retry::{CoordinatorSettings, RetryCoordinator};
use courier_notifier::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_notifier=info,courier_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;
    config.validate()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let store: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(pool.clone()));
    let directory: Arc<dyn RecipientDirectory> = Arc::new(PgRecipientDirectory::new(pool));

    let transport: Arc<dyn Transport> = Arc::new(
        RedisStreamTransport::connect(
            &config.redis_url,
            config.transport_partitions,
            Duration::from_millis(config.transport_block_ms),
        )
        .await?
        .with_claim_idle(Duration::from_secs(config.stale_claim_seconds)),
    );

    let dispatcher = Arc::new(DeliveryDispatcher::new(
        channels::from_config(&config)?,
        directory,
    )?);
    let retry_policy = RetryPolicy::from_config(&config);
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // One consumer per worker slot; names must be unique within the group
    for partition in 0..transport.partitions() {
        for slot in 0..config.workers_per_partition.max(1) {
            let name = format!("{}-{}-{}", config.consumer_name, partition, slot);
            let stream = transport
                .subscribe(&config.transport_topic, partition, &name)
                .await?;
            let worker = Worker::new(name, store.clone(), dispatcher.clone(), retry_policy);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { worker.run(stream, cancel).await }));
        }
    }

    let coordinator = RetryCoordinator::new(
        store.clone(),
        transport.clone(),
        CoordinatorSettings::from_config(&config),
    );
    tasks.push(tokio::spawn({
        let cancel = cancel.clone();
        async move { coordinator.run(cancel).await }
    }));

    tracing::info!(
        partitions = transport.partitions(),
        workers = tasks.len() - 1,
        topic = %config.transport_topic,
        "Workers and retry coordinator running"
    );

    // Run until Ctrl+C, then let in-flight items finish
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Task exited abnormally");
        }
    }

    tracing::info!("Courier worker stopped.");
    Ok(())
}
