use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::AppConfig;

/// Create the PostgreSQL pool shared by the store and the requeue policy.
///
/// Sized by `DB_MAX_CONNECTIONS` (default 10). One claim statement and at
/// most one reconcile write per dispatched row are in flight at a time, so
/// the pool does not need to track `NOTIFIER_DISPATCH_CONCURRENCY`.
pub async fn create_pool(config: &AppConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .connect(&config.database_url)
        .await?;

    tracing::info!(
        max_connections = config.db_max_connections,
        "Connected to PostgreSQL"
    );
    Ok(pool)
}
