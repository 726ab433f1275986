//! Durable notification storage.
//!
//! Every read-modify-write the dispatcher performs goes through this trait:
//! the atomic claim, the bucket fetch, the two reconciliation updates and
//! the requeue policy statements.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ipn_common::error::AppResult;
use ipn_common::types::ClaimedNotification;

pub use memory::MemoryNotificationStore;
pub use postgres::PgNotificationStore;

/// Success write for one notification.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedUpdate {
    pub id: i64,
    pub external_id: Option<String>,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

/// Failure write for one notification.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedUpdate {
    pub id: i64,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Row counts produced by [`NotificationStore::requeue_retries`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueCounts {
    /// Retry rows moved back to `queued`.
    pub requeued: u64,
    /// Retry rows left in place because they reached the attempt ceiling.
    pub exhausted: u64,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Atomically move up to `batch_size` eligible rows (`queued`, bucket 0),
    /// oldest id first, into `processing` under `bucket_id`.
    ///
    /// Returns the number of rows claimed. A row is never claimed by two
    /// buckets, whatever the number of concurrent callers.
    async fn claim(&self, batch_size: u32, bucket_id: i64) -> AppResult<u64>;

    /// Rows currently owned by `bucket_id`, ordered by id.
    async fn fetch_bucket(&self, bucket_id: i64) -> AppResult<Vec<ClaimedNotification>>;

    /// Record a successful submission. Returns `false` when the row is no
    /// longer owned by `bucket_id`.
    async fn mark_submitted(&self, bucket_id: i64, update: &SubmittedUpdate) -> AppResult<bool>;

    /// Record a failed attempt. Returns `false` when the row is no longer
    /// owned by `bucket_id`.
    async fn mark_failed(&self, bucket_id: i64, update: &FailedUpdate) -> AppResult<bool>;

    /// Return `processing` rows last touched before `older_than` to the queue.
    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> AppResult<u64>;

    /// Return `retry` rows below `max_attempts` to the queue.
    async fn requeue_retries(&self, max_attempts: i32) -> AppResult<RequeueCounts>;

    /// Highest bucket id minted by `worker_id`, if any.
    async fn last_bucket_id(&self, worker_id: u64) -> AppResult<Option<i64>>;
}
