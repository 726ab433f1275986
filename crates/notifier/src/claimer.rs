//! Batch claimer: moves eligible notifications into a bucket and loads them.

use std::sync::Arc;

use ipn_common::error::AppResult;
use ipn_common::types::ClaimedNotification;

use crate::store::NotificationStore;

/// What a claim attempt left in the bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// Nothing was eligible.
    Empty,
    /// Rows claimed and loaded for dispatch.
    Ready(Vec<ClaimedNotification>),
    /// Rows were claimed but the bucket fetch came back empty.
    Missing { claimed: u64 },
}

pub struct BatchClaimer {
    store: Arc<dyn NotificationStore>,
    batch_size: u32,
}

impl BatchClaimer {
    pub fn new(store: Arc<dyn NotificationStore>, batch_size: u32) -> Self {
        Self { store, batch_size }
    }

    /// Claim up to `batch_size` rows into `bucket_id`.
    ///
    /// A store error here is fatal for the run; the claim is a single
    /// statement, so nothing was mutated.
    pub async fn claim(&self, bucket_id: i64) -> AppResult<Claim> {
        let claimed = self.store.claim(self.batch_size, bucket_id).await?;
        if claimed == 0 {
            tracing::debug!(bucket_id, "No queued notifications to claim");
            return Ok(Claim::Empty);
        }

        tracing::info!(bucket_id, claimed, "Claimed notification bucket");

        let notifications = self.store.fetch_bucket(bucket_id).await?;
        if notifications.is_empty() {
            tracing::warn!(bucket_id, claimed, "Unable to fetch claimed bucket");
            return Ok(Claim::Missing { claimed });
        }

        if notifications.len() as u64 != claimed {
            tracing::warn!(
                bucket_id,
                claimed,
                fetched = notifications.len(),
                "Fetched bucket size differs from claimed count"
            );
        }

        Ok(Claim::Ready(notifications))
    }
}

#[cfg(test)]
mod tests {
    use ipn_common::types::{Notification, NotificationStatus};

    use super::*;
    use crate::store::MemoryNotificationStore;

    fn store_with(n: i64) -> Arc<MemoryNotificationStore> {
        Arc::new(MemoryNotificationStore::with_rows(
            (1..=n).map(|id| Notification::queued(id, "254700000000", "hello")),
        ))
    }

    #[tokio::test]
    async fn test_empty_backlog() {
        let claimer = BatchClaimer::new(store_with(0), 10);
        assert_eq!(claimer.claim(1).await.unwrap(), Claim::Empty);
    }

    #[tokio::test]
    async fn test_claim_respects_batch_size() {
        let store = store_with(5);
        let claimer = BatchClaimer::new(store.clone(), 3);

        let Claim::Ready(rows) = claimer.claim(555).await.unwrap() else {
            panic!("expected a ready bucket");
        };
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let processing = store
            .all()
            .into_iter()
            .filter(|n| n.status == NotificationStatus::Processing && n.bucket_id == 555)
            .count();
        assert_eq!(processing, 3);
    }

    #[tokio::test]
    async fn test_processing_rows_never_reclaimed() {
        let store = store_with(2);
        let claimer = BatchClaimer::new(store.clone(), 100);

        assert!(matches!(claimer.claim(1).await.unwrap(), Claim::Ready(rows) if rows.len() == 2));
        assert_eq!(claimer.claim(2).await.unwrap(), Claim::Empty);
        assert!(store.all().iter().all(|n| n.bucket_id == 1));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = store_with(2);
        store.set_unavailable(true);
        let claimer = BatchClaimer::new(store, 10);
        assert!(claimer.claim(1).await.is_err());
    }
}
