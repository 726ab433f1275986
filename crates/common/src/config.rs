use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

/// 2021-04-23T11:00:00Z in Unix milliseconds.
pub const DEFAULT_ID_EPOCH_MS: u64 = 1_619_175_600_000;

/// Settings for the outbound SMS / email gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// SMS endpoint (JSON POST)
    pub sms_url: String,

    /// Plain email endpoint (JSON POST)
    pub email_url: String,

    /// Application key sent in the `x-app-id` header
    pub app_key: String,

    /// Product tag attached to every payload (default: "ipn")
    pub product: String,

    /// Default SMS sender id, used when a notification carries none
    pub sender_id: String,

    /// Email sender address
    pub sender_mail: String,

    /// Delivery-report callback URL forwarded to the gateway
    pub notification_url: Option<String>,

    /// Per-call timeout in milliseconds. Unset leaves the transport default.
    pub timeout_ms: Option<u64>,
}

/// Global dispatcher configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// Maximum notifications claimed per run (default: 100)
    pub batch_size: u32,

    /// Interval between scheduled runs in milliseconds (default: 10000)
    pub interval_ms: u64,

    /// Notifications dispatched concurrently within one bucket (default: 8)
    pub dispatch_concurrency: usize,

    /// Worker id encoded into generated ids. `None` leases the first free slot.
    pub worker_id: Option<u64>,

    /// Worker-slot lease duration in milliseconds (default: 30000)
    pub worker_lease_ttl_ms: u64,

    /// Unix milliseconds that bucket id timestamps count from
    /// (default: 1619175600000, 2021-04-23T11:00:00Z)
    pub id_epoch_ms: u64,

    /// Run-lock lease duration in milliseconds (default: 300000)
    pub run_lock_ttl_ms: u64,

    /// Gateway settings
    pub gateway: GatewayConfig,

    /// Send-attempt ceiling for the requeue policy (default: 3)
    pub requeue_max_attempts: i32,

    /// Age after which a `processing` claim is considered abandoned (default: 900000)
    pub stale_claim_after_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| anyhow::anyhow!("{key} environment variable is required"))
        };

        let config = Self {
            database_url: required("DATABASE_URL")?,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?,
            batch_size: parse_or(&lookup, "NOTIFIER_BATCH_SIZE", 100)?,
            interval_ms: parse_or(&lookup, "NOTIFIER_INTERVAL_MS", 10_000)?,
            dispatch_concurrency: parse_or(&lookup, "NOTIFIER_DISPATCH_CONCURRENCY", 8)?,
            worker_id: parse_opt(&lookup, "NOTIFIER_WORKER_ID")?,
            worker_lease_ttl_ms: parse_or(&lookup, "WORKER_LEASE_TTL_MS", 30_000)?,
            id_epoch_ms: parse_or(&lookup, "IPN_EPOCH_MS", DEFAULT_ID_EPOCH_MS)?,
            run_lock_ttl_ms: parse_or(&lookup, "RUN_LOCK_TTL_MS", 300_000)?,
            gateway: GatewayConfig {
                sms_url: required("SMS_GATEWAY_URL")?,
                email_url: required("EMAIL_GATEWAY_URL")?,
                app_key: required("GATEWAY_APP_KEY")?,
                product: lookup("GATEWAY_PRODUCT").unwrap_or_else(|| "ipn".to_string()),
                sender_id: required("SENDER_ID")?,
                sender_mail: required("SENDER_MAIL")?,
                notification_url: lookup("NOTIFICATION_CALLBACK_URL"),
                timeout_ms: parse_opt(&lookup, "GATEWAY_TIMEOUT_MS")?,
            },
            requeue_max_attempts: parse_or(&lookup, "REQUEUE_MAX_ATTEMPTS", 3)?,
            stale_claim_after_ms: parse_or(&lookup, "STALE_CLAIM_AFTER_MS", 900_000)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would break claim ownership.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch_concurrency == 0 {
            anyhow::bail!("NOTIFIER_DISPATCH_CONCURRENCY must be at least 1");
        }
        if self.interval_ms == 0 {
            anyhow::bail!("NOTIFIER_INTERVAL_MS must be greater than 0");
        }
        if self.run_lock_ttl_ms == 0 {
            anyhow::bail!("RUN_LOCK_TTL_MS must be greater than 0");
        }
        if self.worker_lease_ttl_ms == 0 {
            anyhow::bail!("WORKER_LEASE_TTL_MS must be greater than 0");
        }
        if self.id_epoch_ms > Utc::now().timestamp_millis().max(0) as u64 {
            anyhow::bail!("IPN_EPOCH_MS ({}) is in the future", self.id_epoch_ms);
        }
        // A live run's claims must never look stale to the release policy.
        if self.stale_claim_after_ms <= self.run_lock_ttl_ms {
            anyhow::bail!(
                "STALE_CLAIM_AFTER_MS ({}) must be greater than RUN_LOCK_TTL_MS ({})",
                self.stale_claim_after_ms,
                self.run_lock_ttl_ms
            );
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn run_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.run_lock_ttl_ms)
    }

    pub fn worker_lease_ttl(&self) -> Duration {
        Duration::from_millis(self.worker_lease_ttl_ms)
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_millis(self.stale_claim_after_ms)
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T> {
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn parse_opt<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> anyhow::Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{key} must be a valid {}", std::any::type_name::<T>())),
        None => Ok(None),
    }
}
