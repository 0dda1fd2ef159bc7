use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the HTTP API listens on (default: 3000)
    pub api_port: u16,

    /// Length of the fixed quota window in seconds (default: 3600)
    pub quota_window_seconds: u64,

    /// Sends allowed per recipient per window, by channel
    pub quota_email_limit: u64,
    pub quota_sms_limit: u64,
    pub quota_push_limit: u64,
    pub quota_in_app_limit: u64,

    /// How long an event id is remembered for deduplication (default: 24h)
    pub dedup_ttl_seconds: u64,

    /// Base delay of the exponential retry backoff (default: 30s)
    pub retry_base_seconds: u64,

    /// Upper bound on a single retry delay (default: 1h)
    pub retry_max_delay_seconds: u64,

    /// Retry budget for notifications that don't specify one (default: 3)
    pub default_max_retries: u32,

    /// A PROCESSING claim older than this is considered abandoned (default: 300s)
    pub stale_claim_seconds: u64,

    /// A first-attempt PENDING row older than this is republished (default: 60s)
    pub orphan_grace_seconds: u64,

    /// Retry coordinator sweep period (default: 30s)
    pub sweep_interval_seconds: u64,

    /// Random delay added to each sweep, de-synchronises coordinators (default: 2000ms)
    pub sweep_jitter_ms: u64,

    /// Maximum rows handled per sweep query (default: 100)
    pub sweep_batch_size: i64,

    /// Transport topic carrying work items (default: "notifications")
    pub transport_topic: String,

    /// Number of transport partitions (default: 4)
    pub transport_partitions: u32,

    /// How long a worker blocks on an empty partition before re-polling (default: 5000ms)
    pub transport_block_ms: u64,

    /// Worker tasks started per partition (default: 1)
    pub workers_per_partition: u32,

    /// Consumer name used in the transport consumer group
    pub consumer_name: String,

    /// Provider gateway endpoints. Unset means "log only".
    pub email_gateway_url: Option<String>,
    pub sms_gateway_url: Option<String>,
    pub push_gateway_url: Option<String>,

    /// Bearer token sent to provider gateways
    pub gateway_api_key: Option<String>,

    /// Request timeout for provider gateways (default: 10s)
    pub gateway_timeout_seconds: u64,

    /// JSON file of named templates loaded by the API. Unset means no templates.
    pub templates_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            api_port: parse_var("API_PORT", 3000)?,
            quota_window_seconds: parse_var("QUOTA_WINDOW_SECONDS", 3600)?,
            quota_email_limit: parse_var("QUOTA_EMAIL_LIMIT", 10)?,
            quota_sms_limit: parse_var("QUOTA_SMS_LIMIT", 5)?,
            quota_push_limit: parse_var("QUOTA_PUSH_LIMIT", 20)?,
            quota_in_app_limit: parse_var("QUOTA_IN_APP_LIMIT", 100)?,
            dedup_ttl_seconds: parse_var("DEDUP_TTL_SECONDS", 86_400)?,
            retry_base_seconds: parse_var("RETRY_BASE_SECONDS", 30)?,
            retry_max_delay_seconds: parse_var("RETRY_MAX_DELAY_SECONDS", 3600)?,
            default_max_retries: parse_var("DEFAULT_MAX_RETRIES", 3)?,
            stale_claim_seconds: parse_var("STALE_CLAIM_SECONDS", 300)?,
            orphan_grace_seconds: parse_var("ORPHAN_GRACE_SECONDS", 60)?,
            sweep_interval_seconds: parse_var("SWEEP_INTERVAL_SECONDS", 30)?,
            sweep_jitter_ms: parse_var("SWEEP_JITTER_MS", 2000)?,
            sweep_batch_size: parse_var("SWEEP_BATCH_SIZE", 100)?,
            transport_topic: std::env::var("TRANSPORT_TOPIC")
                .unwrap_or_else(|_| "notifications".to_string()),
            transport_partitions: parse_var("TRANSPORT_PARTITIONS", 4)?,
            transport_block_ms: parse_var("TRANSPORT_BLOCK_MS", 5000)?,
            workers_per_partition: parse_var("WORKERS_PER_PARTITION", 1)?,
            consumer_name: std::env::var("CONSUMER_NAME")
                .unwrap_or_else(|_| format!("courier-{}", uuid::Uuid::new_v4().simple())),
            email_gateway_url: std::env::var("EMAIL_GATEWAY_URL").ok(),
            sms_gateway_url: std::env::var("SMS_GATEWAY_URL").ok(),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok(),
            gateway_api_key: std::env::var("GATEWAY_API_KEY").ok(),
            gateway_timeout_seconds: parse_var("GATEWAY_TIMEOUT_SECONDS", 10)?,
            templates_path: std::env::var("TEMPLATES_PATH").ok(),
        })
    }

    /// Validate cross-field constraints that `from_env` can't express per variable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transport_partitions == 0 {
            anyhow::bail!("TRANSPORT_PARTITIONS must be at least 1");
        }
        if self.quota_window_seconds == 0 {
            anyhow::bail!("QUOTA_WINDOW_SECONDS must be at least 1");
        }
        if self.retry_max_delay_seconds < self.retry_base_seconds {
            anyhow::bail!("RETRY_MAX_DELAY_SECONDS must not be lower than RETRY_BASE_SECONDS");
        }
        if self.sweep_batch_size <= 0 {
            anyhow::bail!("SWEEP_BATCH_SIZE must be positive");
        }
        Ok(())
    }
}

impl Default for AppConfig {
    /// Defaults matching `from_env` with an empty environment, minus the database URL.
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: "redis://localhost:6379".to_string(),
            db_max_connections: 20,
            api_port: 3000,
            quota_window_seconds: 3600,
            quota_email_limit: 10,
            quota_sms_limit: 5,
            quota_push_limit: 20,
            quota_in_app_limit: 100,
            dedup_ttl_seconds: 86_400,
            retry_base_seconds: 30,
            retry_max_delay_seconds: 3600,
            default_max_retries: 3,
            stale_claim_seconds: 300,
            orphan_grace_seconds: 60,
            sweep_interval_seconds: 30,
            sweep_jitter_ms: 2000,
            sweep_batch_size: 100,
            transport_topic: "notifications".to_string(),
            transport_partitions: 4,
            transport_block_ms: 5000,
            workers_per_partition: 1,
            consumer_name: "courier-local".to_string(),
            email_gateway_url: None,
            sms_gateway_url: None,
            push_gateway_url: None,
            gateway_api_key: None,
            gateway_timeout_seconds: 10,
            templates_path: None,
        }
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quota_email_limit, 10);
        assert_eq!(config.quota_sms_limit, 5);
        assert_eq!(config.default_max_retries, 3);
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let config = AppConfig {
            transport_partitions: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_cap_below_base_rejected() {
        let config = AppConfig {
            retry_base_seconds: 600,
            retry_max_delay_seconds: 60,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_var_falls_back_to_default() {
        let value: u64 = parse_var("COURIER_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
