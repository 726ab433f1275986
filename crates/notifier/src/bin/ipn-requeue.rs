//! One-shot requeue policy run. Schedule it externally (cron, k8s CronJob).

use std::sync::Arc;

use ipn_common::config::AppConfig;
use ipn_common::db;
use ipn_common::redis_pool::create_redis_pool;
use ipn_notifier::requeue::RequeuePolicy;
use ipn_notifier::run_lock::RedisRunLock;
use ipn_notifier::store::PgNotificationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ipn_notifier=info,ipn_common=info".into()),
        )
        .json()
        .init();

    let config = AppConfig::from_env()?;
    let pool = db::create_pool(&config).await?;
    let redis = create_redis_pool(&config.redis_url).await?;

    let policy = RequeuePolicy::from_config(
        Arc::new(PgNotificationStore::new(pool)),
        Arc::new(RedisRunLock::new(redis)),
        &config,
    );

    let report = policy.run().await?;
    tracing::info!(
        released = ?report.released,
        requeued = report.requeued,
        exhausted = report.exhausted,
        "Requeue policy applied"
    );
    Ok(())
}
