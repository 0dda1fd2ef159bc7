//! Shared application state for the Axum API server.

use std::sync::Arc;
use std::time::Duration;

use courier_common::config::AppConfig;
use courier_common::db::{create_pool, run_migrations};
use courier_common::redis_pool::create_redis_pool;
use courier_engine::dedup::{DedupStore, RedisDedupBackend};
use courier_engine::orchestrator::Orchestrator;
use courier_engine::quota::{QuotaLimits, QuotaTracker, RedisQuotaBackend};
use courier_engine::recipient::PgRecipientDirectory;
use courier_engine::state::RetryPolicy;
use courier_engine::store::PgNotificationStore;
use courier_engine::template::MemoryTemplateEngine;
use courier_engine::transport::RedisStreamTransport;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Wire the production backends: PostgreSQL for records and recipients,
    /// Redis for quota, dedup and the work-item streams.
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let pool = create_pool(&config.database_url, config.db_max_connections).await?;
        run_migrations(&pool).await?;

        let redis = create_redis_pool(&config.redis_url).await?;
        let transport = RedisStreamTransport::connect(
            &config.redis_url,
            config.transport_partitions,
            Duration::from_millis(config.transport_block_ms),
        )
        .await?;

        let templates = match &config.templates_path {
            Some(path) => MemoryTemplateEngine::load(path).await?,
            None => MemoryTemplateEngine::new(),
        };

        let orchestrator = Orchestrator::new(
            Arc::new(PgRecipientDirectory::new(pool.clone())),
            Arc::new(templates),
            DedupStore::from_config(Arc::new(RedisDedupBackend::new(redis.clone())), config),
            QuotaTracker::new(
                Arc::new(RedisQuotaBackend::new(redis)),
                QuotaLimits::from_config(config),
            ),
            Arc::new(PgNotificationStore::new(pool)),
            Arc::new(transport),
            config.transport_topic.clone(),
            RetryPolicy::from_config(config),
        );

        Ok(Self::new(orchestrator))
    }
}
