use std::sync::Arc;
use std::time::Duration;

use ferroid::time::MonotonicClock;
use tokio::sync::watch;

use ipn_common::config::AppConfig;
use ipn_common::db;
use ipn_common::redis_pool::create_redis_pool;
use ipn_notifier::gateway::HttpGateway;
use ipn_notifier::idgen::{IdGenerator, WorkerLease};
use ipn_notifier::pipeline::{Pipeline, PipelineOptions};
use ipn_notifier::run_lock::RedisRunLock;
use ipn_notifier::scheduler::Scheduler;
use ipn_notifier::store::{NotificationStore, PgNotificationStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ipn_notifier=info,ipn_common=info".into()),
        )
        .json()
        .init();

    tracing::info!("IPN notifier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config).await?;

    // Run migrations
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let redis = create_redis_pool(&config.redis_url).await?;
    let store = Arc::new(PgNotificationStore::new(pool));

    // Lease a worker id for the life of the process
    let slots = Arc::new(RedisRunLock::with_prefix(redis.clone(), "ipn:"));
    let worker = WorkerLease::acquire(slots, config.worker_id, config.worker_lease_ttl()).await?;
    let worker_id = worker.worker_id();

    // Bucket id generator, continuing after the last bucket this worker issued
    let clock = MonotonicClock::with_epoch(Duration::from_millis(config.id_epoch_ms));
    let generator = match store.last_bucket_id(worker_id).await? {
        Some(last) => IdGenerator::resume_after(worker_id, last, clock)?,
        None => IdGenerator::new(worker_id, clock)?,
    };
    tracing::info!(worker_id, epoch_ms = config.id_epoch_ms, "Id generator ready");

    let gateway = Arc::new(HttpGateway::new(config.gateway.clone())?);
    let run_lock = Arc::new(RedisRunLock::new(redis));

    let pipeline = Arc::new(Pipeline::new(
        store,
        gateway,
        Arc::new(generator),
        run_lock,
        PipelineOptions::from_config(&config),
    ));
    let scheduler = Scheduler::new(pipeline, config.interval());

    // Stop after the in-flight run on Ctrl+C
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Received shutdown signal, stopping gracefully...");
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await;

    if !worker.is_held() {
        tracing::error!(worker_id, "Worker id lease was lost while running");
    }
    if let Err(e) = worker.release().await {
        tracing::warn!(worker_id, error = %e, "Failed to release worker id lease");
    }

    tracing::info!("IPN notifier stopped.");
    Ok(())
}
