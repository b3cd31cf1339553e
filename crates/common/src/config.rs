use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
///
/// Every tunable of the delivery pipeline lives here. The engine types
/// (`RetryPolicy`, `WorkerSettings`, `SweepSettings`) are built from these
/// values and carry no defaults of their own.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (dispatch queue)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Address the HTTP API binds to (default: 0.0.0.0:3000)
    pub api_bind_addr: String,

    /// Telegram bot token used by the delivery worker
    pub telegram_bot_token: Option<String>,

    /// Telegram Bot API base URL (overridable for staging proxies)
    pub telegram_api_url: String,

    /// Initial retry delay in milliseconds (default: 1000)
    pub retry_base_ms: u64,

    /// Ceiling for a single retry delay in milliseconds (default: 60000)
    pub retry_max_delay_ms: u64,

    /// Total delivery attempts allowed per task, first attempt included (default: 5)
    pub retry_max_attempts: i32,

    /// Jitter added on top of the delay, as a fraction of it (default: 0.2)
    pub retry_jitter_fraction: f64,

    /// Number of concurrent delivery workers (default: 4)
    pub worker_concurrency: usize,

    /// How long a claim may stay `in_flight` before the sweeper reclaims it (default: 300)
    pub claim_staleness_secs: u64,

    /// Upper bound on a single send call in milliseconds (default: 10000)
    pub send_timeout_ms: u64,

    /// Seconds before an unacknowledged queue entry is redelivered (default: 60)
    pub queue_visibility_timeout_secs: u64,

    /// Key prefix for the Redis dispatch queue (default: herald:dispatch)
    pub queue_key_prefix: String,

    /// Worker sleep between polls of an empty queue in milliseconds (default: 500)
    pub worker_poll_interval_ms: u64,

    /// Interval between recovery sweeps in seconds (default: 30)
    pub sweep_interval_secs: u64,

    /// Age after which a `pending` task without a queue entry is re-dispatched (default: 60)
    pub orphan_grace_secs: u64,

    /// Redelivery delay for an entry whose claim hit an unreachable store (default: 1000)
    pub storage_backoff_ms: u64,

    /// Maximum tasks examined per sweep step (default: 500)
    pub sweep_batch_size: i64,

    /// Largest accepted payload in bytes (default: 4096)
    pub max_payload_bytes: usize,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            api_bind_addr: std::env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_api_url: std::env::var("TELEGRAM_API_URL")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            retry_base_ms: parse_var("RETRY_BASE_MS", 1_000)?,
            retry_max_delay_ms: parse_var("RETRY_MAX_DELAY_MS", 60_000)?,
            retry_max_attempts: parse_var("RETRY_MAX_ATTEMPTS", 5)?,
            retry_jitter_fraction: parse_var("RETRY_JITTER_FRACTION", 0.2)?,
            worker_concurrency: parse_var("WORKER_CONCURRENCY", 4)?,
            claim_staleness_secs: parse_var("CLAIM_STALENESS_SECS", 300)?,
            send_timeout_ms: parse_var("SEND_TIMEOUT_MS", 10_000)?,
            queue_visibility_timeout_secs: parse_var("QUEUE_VISIBILITY_TIMEOUT_SECS", 60)?,
            queue_key_prefix: std::env::var("QUEUE_KEY_PREFIX")
                .unwrap_or_else(|_| "herald:dispatch".to_string()),
            worker_poll_interval_ms: parse_var("WORKER_POLL_INTERVAL_MS", 500)?,
            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS", 30)?,
            orphan_grace_secs: parse_var("ORPHAN_GRACE_SECS", 60)?,
            storage_backoff_ms: parse_var("STORAGE_BACKOFF_MS", 1_000)?,
            sweep_batch_size: parse_var("SWEEP_BATCH_SIZE", 500)?,
            max_payload_bytes: parse_var("MAX_PAYLOAD_BYTES", 4_096)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_max_attempts < 1 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if self.retry_base_ms == 0 {
            anyhow::bail!("RETRY_BASE_MS must be greater than zero");
        }
        if self.retry_max_delay_ms < self.retry_base_ms {
            anyhow::bail!("RETRY_MAX_DELAY_MS must not be smaller than RETRY_BASE_MS");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_fraction) {
            anyhow::bail!("RETRY_JITTER_FRACTION must be within [0, 1]");
        }
        if self.worker_concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.worker_poll_interval_ms == 0 {
            anyhow::bail!("WORKER_POLL_INTERVAL_MS must be greater than zero");
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be greater than zero");
        }
        if self.sweep_batch_size < 1 {
            anyhow::bail!("SWEEP_BATCH_SIZE must be at least 1");
        }
        if self.storage_backoff_ms == 0 {
            anyhow::bail!("STORAGE_BACKOFF_MS must be greater than zero");
        }
        if self.max_payload_bytes == 0 {
            anyhow::bail!("MAX_PAYLOAD_BYTES must be greater than zero");
        }

        // An entry must not become visible again while its send is still running.
        let visibility_ms = secs_to_ms(
            self.queue_visibility_timeout_secs,
            "QUEUE_VISIBILITY_TIMEOUT_SECS",
        )?;
        if visibility_ms <= self.send_timeout_ms {
            anyhow::bail!("QUEUE_VISIBILITY_TIMEOUT_SECS must exceed SEND_TIMEOUT_MS");
        }
        // Nor may the sweeper take a claim back while its send is still running,
        // or a redelivered entry would re-claim and send the task a second time.
        let staleness_ms = secs_to_ms(self.claim_staleness_secs, "CLAIM_STALENESS_SECS")?;
        if staleness_ms <= self.send_timeout_ms {
            anyhow::bail!("CLAIM_STALENESS_SECS must exceed SEND_TIMEOUT_MS");
        }
        if staleness_ms < visibility_ms {
            anyhow::bail!(
                "CLAIM_STALENESS_SECS must not be shorter than QUEUE_VISIBILITY_TIMEOUT_SECS"
            );
        }
        Ok(())
    }
}

fn secs_to_ms(secs: u64, name: &str) -> anyhow::Result<u64> {
    secs.checked_mul(1_000)
        .ok_or_else(|| anyhow::anyhow!("{} is out of range", name))
}

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
