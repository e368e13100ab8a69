use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (counter store and broker)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the HTTP API binds to (default: 3000)
    pub api_port: u16,

    /// Base URL of the external notification provider
    pub provider_base_url: String,

    /// Provider request timeout in milliseconds (default: 5000)
    pub provider_timeout_ms: u64,

    /// Prefix for callback URLs stored as relative paths
    pub callback_base_url: Option<String>,

    /// Callback request timeout in milliseconds (default: 5000)
    pub callback_timeout_ms: u64,

    /// Number of concurrent consumer loops per worker process (default: 4)
    pub worker_concurrency: usize,

    /// Consumer name prefix, stable across restarts of the same worker so it
    /// reclaims its own unacknowledged messages (default: `HOSTNAME`)
    pub worker_name: String,

    /// Pipeline tunables
    pub dispatch: DispatchSettings,

    /// Queue and exchange names
    pub topology: BrokerTopology,
}

/// Tunables of the dispatch pipeline.
///
/// Kept apart from `AppConfig` so the engine can be built in tests without
/// touching the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSettings {
    /// In-process provider attempts per item before recording PUSH_FAILED
    pub max_attempts: u32,
    /// A `delayTime` must lie further ahead than this to be deferred
    pub delay_threshold_ms: i64,
    /// Furthest ahead a `delayTime` may lie
    pub max_delay_ms: i64,
    /// How often the reconciliation sweep is attempted
    pub reconcile_interval_secs: u64,
    /// Age after which a READY task is considered stuck
    pub stale_after_secs: i64,
    /// Lock TTL of the single-runner scheduler, also the minimum re-run spacing
    pub single_runner_ttl_secs: u64,
    /// Idle lifetime of a cached provider client
    pub client_cache_ttl_secs: u64,
    /// Maximum number of cached provider clients
    pub client_cache_capacity: usize,
    /// How long a consumer blocks waiting for a message before re-checking
    pub consume_timeout_ms: u64,
    /// Age after which an unacknowledged in-flight message is returned to the
    /// live queue, whichever consumer held it
    pub in_flight_timeout_secs: u64,
}

impl DispatchSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn single_runner_ttl(&self) -> Duration {
        Duration::from_secs(self.single_runner_ttl_secs)
    }

    pub fn client_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.client_cache_ttl_secs)
    }

    pub fn consume_timeout(&self) -> Duration {
        Duration::from_millis(self.consume_timeout_ms)
    }

    pub fn in_flight_timeout(&self) -> Duration {
        Duration::from_secs(self.in_flight_timeout_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs)
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_threshold_ms: 1000,
            max_delay_ms: 30 * 24 * 60 * 60 * 1000,
            reconcile_interval_secs: 60,
            stale_after_secs: 30 * 60,
            single_runner_ttl_secs: 10 * 60,
            client_cache_ttl_secs: 60 * 60,
            client_cache_capacity: 256,
            consume_timeout_ms: 1000,
            in_flight_timeout_secs: 5 * 60,
        }
    }
}

/// Names of the broker queues the pipeline uses.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerTopology {
    /// Queue the delivery workers consume
    pub live_queue: String,
    /// Holding queue for deferred items, dead-letters into `live_queue` on expiry
    pub deferred_queue: String,
    /// Permanently rejected (unparseable) items
    pub dead_letter_queue: String,
    /// Fan-out target for completion summaries whose callback failed
    pub callback_retry_exchange: String,
    /// Routing key of templated notification items
    pub routing_key: String,
}

impl Default for BrokerTopology {
    fn default() -> Self {
        Self {
            live_queue: "message_queue".to_string(),
            deferred_queue: "delay_message_queue".to_string(),
            dead_letter_queue: "dlx_message_queue".to_string(),
            callback_retry_exchange: "message_callback_exchange".to_string(),
            routing_key: "notification/template".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = DispatchSettings::default();
        let topology = BrokerTopology::default();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 20)?,
            api_port: parse_env("API_PORT", 3000)?,
            provider_base_url: std::env::var("PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "https://api.weixin.qq.com".to_string()),
            provider_timeout_ms: parse_env("PROVIDER_TIMEOUT_MS", 5000)?,
            callback_base_url: std::env::var("CALLBACK_BASE_URL").ok(),
            callback_timeout_ms: parse_env("CALLBACK_TIMEOUT_MS", 5000)?,
            worker_concurrency: parse_env("WORKER_CONCURRENCY", 4)?,
            worker_name: std::env::var("WORKER_NAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "worker".to_string()),
            dispatch: DispatchSettings {
                max_attempts: parse_env("DELIVERY_MAX_ATTEMPTS", defaults.max_attempts)?,
                delay_threshold_ms: parse_env("DELAY_THRESHOLD_MS", defaults.delay_threshold_ms)?,
                max_delay_ms: parse_env("MAX_DELAY_MS", defaults.max_delay_ms)?,
                reconcile_interval_secs: parse_env(
                    "RECONCILE_INTERVAL_SECS",
                    defaults.reconcile_interval_secs,
                )?,
                stale_after_secs: parse_env("RECONCILE_STALE_AFTER_SECS", defaults.stale_after_secs)?,
                single_runner_ttl_secs: parse_env(
                    "SINGLE_RUNNER_TTL_SECS",
                    defaults.single_runner_ttl_secs,
                )?,
                client_cache_ttl_secs: parse_env(
                    "CLIENT_CACHE_TTL_SECS",
                    defaults.client_cache_ttl_secs,
                )?,
                client_cache_capacity: parse_env(
                    "CLIENT_CACHE_CAPACITY",
                    defaults.client_cache_capacity,
                )?,
                consume_timeout_ms: parse_env("CONSUME_TIMEOUT_MS", defaults.consume_timeout_ms)?,
                in_flight_timeout_secs: parse_env(
                    "IN_FLIGHT_TIMEOUT_SECS",
                    defaults.in_flight_timeout_secs,
                )?,
            },
            topology: BrokerTopology {
                live_queue: std::env::var("QUEUE_LIVE").unwrap_or(topology.live_queue),
                deferred_queue: std::env::var("QUEUE_DEFERRED").unwrap_or(topology.deferred_queue),
                dead_letter_queue: std::env::var("QUEUE_DEAD_LETTER")
                    .unwrap_or(topology.dead_letter_queue),
                callback_retry_exchange: std::env::var("EXCHANGE_CALLBACK_RETRY")
                    .unwrap_or(topology.callback_retry_exchange),
                routing_key: std::env::var("ROUTING_KEY").unwrap_or(topology.routing_key),
            },
        })
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn parse_env<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", name, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}
