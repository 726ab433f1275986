//! In-memory [`NotificationStore`] for tests and local simulation.
//!
//! The whole table sits behind one mutex, so every operation is a single
//! critical section. That makes the claim a compare-and-set over the table,
//! matching the guarantee of the Postgres statement.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use ipn_common::error::{AppError, AppResult};
use ipn_common::types::{ClaimedNotification, Notification, NotificationStatus};

use crate::idgen;

use super::{FailedUpdate, NotificationStore, RequeueCounts, SubmittedUpdate};

#[derive(Default)]
pub struct MemoryNotificationStore {
    rows: Mutex<BTreeMap<i64, Notification>>,
    failing_updates: Mutex<HashSet<i64>>,
    unavailable: AtomicBool,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = Notification>) -> Self {
        let store = Self::new();
        for row in rows {
            store.insert(row);
        }
        store
    }

    pub fn insert(&self, notification: Notification) {
        self.rows.lock().insert(notification.id, notification);
    }

    pub fn get(&self, id: i64) -> Option<Notification> {
        self.rows.lock().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.rows.lock().values().cloned().collect()
    }

    /// Make reconciliation writes for `id` fail with a storage error.
    pub fn fail_updates_for(&self, id: i64) {
        self.failing_updates.lock().insert(id);
    }

    /// Make every operation fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Backdate a row's `modified_at`, for stale-claim scenarios.
    pub fn touch(&self, id: i64, modified_at: DateTime<Utc>) {
        if let Some(row) = self.rows.lock().get_mut(&id) {
            row.modified_at = modified_at;
        }
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn check_update(&self, id: i64) -> AppResult<()> {
        self.check_available()?;
        if self.failing_updates.lock().contains(&id) {
            return Err(AppError::Database(sqlx::Error::RowNotFound));
        }
        Ok(())
    }
}

fn owned_by(row: &Notification, bucket_id: i64) -> bool {
    row.bucket_id == bucket_id && row.status == NotificationStatus::Processing
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn claim(&self, batch_size: u32, bucket_id: i64) -> AppResult<u64> {
        self.check_available()?;
        if batch_size == 0 {
            return Ok(0);
        }

        let now = Utc::now();
        let mut rows = self.rows.lock();
        let mut claimed = 0u64;
        for row in rows.values_mut().filter(|r| r.is_claimable()) {
            row.status = NotificationStatus::Processing;
            row.bucket_id = bucket_id;
            row.modified_at = now;
            claimed += 1;
            if claimed == batch_size as u64 {
                break;
            }
        }
        Ok(claimed)
    }

    async fn fetch_bucket(&self, bucket_id: i64) -> AppResult<Vec<ClaimedNotification>> {
        self.check_available()?;
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|r| owned_by(r, bucket_id))
            .map(Notification::to_claimed)
            .collect())
    }

    async fn mark_submitted(&self, bucket_id: i64, update: &SubmittedUpdate) -> AppResult<bool> {
        self.check_update(update.id)?;
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&update.id).filter(|r| owned_by(r, bucket_id)) else {
            return Ok(false);
        };

        row.status = NotificationStatus::Submitted;
        row.external_id = update.external_id.clone();
        row.provider_id = update.external_id.clone();
        row.send_attempts += 1;
        row.last_message = update.message.clone();
        row.last_error = None;
        row.queued_at = Some(update.at);
        row.modified_at = update.at;
        Ok(true)
    }

    async fn mark_failed(&self, bucket_id: i64, update: &FailedUpdate) -> AppResult<bool> {
        self.check_update(update.id)?;
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&update.id).filter(|r| owned_by(r, bucket_id)) else {
            return Ok(false);
        };

        row.status = NotificationStatus::Retry;
        row.send_attempts += 1;
        row.last_error = Some(update.error.clone());
        row.modified_at = update.at;
        Ok(true)
    }

    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        self.check_available()?;
        let now = Utc::now();
        let mut released = 0;
        for row in self.rows.lock().values_mut() {
            if row.status == NotificationStatus::Processing && row.modified_at < older_than {
                row.status = NotificationStatus::Queued;
                row.bucket_id = 0;
                row.modified_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn requeue_retries(&self, max_attempts: i32) -> AppResult<RequeueCounts> {
        self.check_available()?;
        let now = Utc::now();
        let mut counts = RequeueCounts::default();
        for row in self.rows.lock().values_mut() {
            if row.status != NotificationStatus::Retry {
                continue;
            }
            if row.send_attempts < max_attempts {
                row.status = NotificationStatus::Queued;
                row.bucket_id = 0;
                row.modified_at = now;
                counts.requeued += 1;
            } else {
                counts.exhausted += 1;
            }
        }
        Ok(counts)
    }

    async fn last_bucket_id(&self, worker_id: u64) -> AppResult<Option<i64>> {
        self.check_available()?;
        Ok(self
            .rows
            .lock()
            .values()
            .map(|r| r.bucket_id)
            .filter(|id| *id > 0 && idgen::decompose(*id).worker_id == worker_id)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backlog(n: i64) -> MemoryNotificationStore {
        MemoryNotificationStore::with_rows(
            (1..=n).map(|id| Notification::queued(id, format!("25470000{id:04}"), "hi")),
        )
    }

    #[tokio::test]
    async fn test_claim_takes_oldest_first() {
        let store = backlog(5);
        assert_eq!(store.claim(2, 77).await.unwrap(), 2);

        let bucket: Vec<i64> = store.fetch_bucket(77).await.unwrap().iter().map(|n| n.id).collect();
        assert_eq!(bucket, vec![1, 2]);
        assert_eq!(store.get(3).unwrap().status, NotificationStatus::Queued);
    }

    #[tokio::test]
    async fn test_zero_batch_claims_nothing() {
        let store = backlog(3);
        assert_eq!(store.claim(0, 77).await.unwrap(), 0);
        assert!(store.all().iter().all(Notification::is_claimable));
    }

    #[tokio::test]
    async fn test_unavailable_store_mutates_nothing() {
        let store = backlog(3);
        store.set_unavailable(true);
        assert!(store.claim(3, 9).await.is_err());

        store.set_unavailable(false);
        assert!(store.all().iter().all(Notification::is_claimable));
    }

    #[tokio::test]
    async fn test_update_rejected_outside_bucket() {
        let store = backlog(1);
        store.claim(1, 10).await.unwrap();

        let update = FailedUpdate {
            id: 1,
            error: "boom".to_string(),
            at: Utc::now(),
        };
        assert!(!store.mark_failed(11, &update).await.unwrap());
        assert!(store.mark_failed(10, &update).await.unwrap());
        // Already reconciled: a second write is rejected.
        assert!(!store.mark_failed(10, &update).await.unwrap());
        assert_eq!(store.get(1).unwrap().send_attempts, 1);
    }

    fn bucket(timestamp: i64, worker_id: i64) -> i64 {
        (timestamp << 18) | (worker_id << idgen::WORKER_SHIFT)
    }

    #[tokio::test]
    async fn test_last_bucket_id_per_worker() {
        let store = backlog(3);
        assert_eq!(store.last_bucket_id(1).await.unwrap(), None);

        store.claim(1, bucket(300, 1)).await.unwrap();
        store.claim(1, bucket(200, 1)).await.unwrap();
        // Newer bucket from another worker does not count.
        store.claim(1, bucket(900, 2)).await.unwrap();

        assert_eq!(store.last_bucket_id(1).await.unwrap(), Some(bucket(300, 1)));
        assert_eq!(store.last_bucket_id(2).await.unwrap(), Some(bucket(900, 2)));
        assert_eq!(store.last_bucket_id(0).await.unwrap(), None);
    }
}
