//! Requeue policy for rows the pipeline leaves behind.
//!
//! The pipeline never re-enqueues anything itself. This policy is an
//! explicitly separate operation, scheduled by operators:
//! - `retry` rows below the attempt ceiling go back to `queued`
//! - `processing` rows whose claim is older than the stale threshold go back
//!   to `queued`, but only while no dispatch run holds the lease

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use ipn_common::config::AppConfig;
use ipn_common::error::{AppError, AppResult};

use crate::pipeline::DISPATCH_LOCK_KEY;
use crate::run_lock::RunLock;
use crate::store::NotificationStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueReport {
    /// Stale claims released; `None` when a dispatch run was active.
    pub released: Option<u64>,
    pub requeued: u64,
    /// Retry rows at the attempt ceiling, left untouched.
    pub exhausted: u64,
}

pub struct RequeuePolicy {
    store: Arc<dyn NotificationStore>,
    run_lock: Arc<dyn RunLock>,
    max_attempts: i32,
    stale_after: Duration,
    lock_ttl: Duration,
}

impl RequeuePolicy {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        run_lock: Arc<dyn RunLock>,
        max_attempts: i32,
        stale_after: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            store,
            run_lock,
            max_attempts,
            stale_after,
            lock_ttl,
        }
    }

    pub fn from_config(
        store: Arc<dyn NotificationStore>,
        run_lock: Arc<dyn RunLock>,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            store,
            run_lock,
            config.requeue_max_attempts,
            config.stale_claim_after(),
            config.run_lock_ttl(),
        )
    }

    pub async fn run(&self) -> AppResult<RequeueReport> {
        let released = self.release_stale_claims().await?;
        let counts = self.store.requeue_retries(self.max_attempts).await?;

        if counts.exhausted > 0 {
            tracing::warn!(
                exhausted = counts.exhausted,
                max_attempts = self.max_attempts,
                "Notifications reached the send-attempt ceiling"
            );
        }

        Ok(RequeueReport {
            released,
            requeued: counts.requeued,
            exhausted: counts.exhausted,
        })
    }

    /// Holding the dispatch lease guarantees no live run owns the rows.
    async fn release_stale_claims(&self) -> AppResult<Option<u64>> {
        let Some(lease) = self
            .run_lock
            .try_acquire(DISPATCH_LOCK_KEY, self.lock_ttl)
            .await?
        else {
            tracing::info!("Dispatch run active, skipping stale-claim release");
            return Ok(None);
        };

        let stale_after = chrono::Duration::from_std(self.stale_after)
            .map_err(|e| AppError::Config(format!("stale claim threshold: {e}")));
        let result = match stale_after {
            Ok(stale_after) => self.store.release_stale_claims(Utc::now() - stale_after).await,
            Err(e) => Err(e),
        };

        if let Err(e) = self.run_lock.release(&lease).await {
            tracing::warn!(error = %e, "Failed to release dispatch lease after requeue");
        }

        let released = result?;
        if released > 0 {
            tracing::warn!(released, "Released stale notification claims");
        }
        Ok(Some(released))
    }
}

#[cfg(test)]
mod tests {
    use ipn_common::types::{Notification, NotificationStatus};

    use super::*;
    use crate::run_lock::MemoryRunLock;
    use crate::store::{FailedUpdate, MemoryNotificationStore};

    const STALE: Duration = Duration::from_secs(600);
    const TTL: Duration = Duration::from_secs(60);

    async fn retry_row(store: &MemoryNotificationStore, id: i64, attempts: i32) {
        let mut row = Notification::queued(id, "254700000000", "hi");
        row.send_attempts = attempts - 1;
        store.insert(row);
        store.claim(1, 1_000 + id).await.unwrap();
        let update = FailedUpdate {
            id,
            error: "down".to_string(),
            at: Utc::now(),
        };
        store.mark_failed(1_000 + id, &update).await.unwrap();
    }

    #[tokio::test]
    async fn test_requeue_respects_ceiling() {
        let store = Arc::new(MemoryNotificationStore::new());
        retry_row(&store, 1, 1).await;
        retry_row(&store, 2, 3).await;

        let policy = RequeuePolicy::new(store.clone(), Arc::new(MemoryRunLock::new()), 3, STALE, TTL);
        let report = policy.run().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.exhausted, 1);

        let requeued = store.get(1).unwrap();
        assert!(requeued.is_claimable());
        assert_eq!(requeued.send_attempts, 1);
        assert_eq!(store.get(2).unwrap().status, NotificationStatus::Retry);
    }

    #[tokio::test]
    async fn test_releases_only_stale_claims() {
        let store = Arc::new(MemoryNotificationStore::with_rows([
            Notification::queued(1, "254700000000", "old"),
            Notification::queued(2, "254700000000", "fresh"),
        ]));
        store.claim(2, 42).await.unwrap();
        store.touch(1, Utc::now() - chrono::Duration::hours(1));

        let policy = RequeuePolicy::new(store.clone(), Arc::new(MemoryRunLock::new()), 3, STALE, TTL);
        let report = policy.run().await.unwrap();
        assert_eq!(report.released, Some(1));

        assert!(store.get(1).unwrap().is_claimable());
        assert_eq!(store.get(1).unwrap().send_attempts, 0);
        assert_eq!(store.get(2).unwrap().status, NotificationStatus::Processing);
    }

    #[tokio::test]
    async fn test_active_run_blocks_stale_release() {
        let store = Arc::new(MemoryNotificationStore::with_rows([Notification::queued(
            1,
            "254700000000",
            "old",
        )]));
        store.claim(1, 42).await.unwrap();
        store.touch(1, Utc::now() - chrono::Duration::hours(1));

        let lock = Arc::new(MemoryRunLock::new());
        let _live = lock.try_acquire(DISPATCH_LOCK_KEY, TTL).await.unwrap().unwrap();

        let policy = RequeuePolicy::new(store.clone(), lock.clone(), 3, STALE, TTL);
        let report = policy.run().await.unwrap();
        assert_eq!(report.released, None);
        assert_eq!(store.get(1).unwrap().status, NotificationStatus::Processing);
        assert!(lock.is_held(DISPATCH_LOCK_KEY));
    }
}
