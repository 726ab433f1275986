use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use ipn_common::error::AppResult;
use ipn_common::types::{ClaimedNotification, NotificationStatus};

use crate::idgen;

use super::{FailedUpdate, NotificationStore, RequeueCounts, SubmittedUpdate};

/// PostgreSQL-backed notification store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn claim(&self, batch_size: u32, bucket_id: i64) -> AppResult<u64> {
        if batch_size == 0 {
            return Ok(0);
        }

        // Single statement: rows locked by a concurrent claimer are skipped,
        // and the outer predicate re-checks eligibility on the locked row.
        let result = sqlx::query(
            r#"
            WITH batch AS (
                SELECT id
                FROM notifications
                WHERE status = $3 AND bucket_id = 0
                ORDER BY id ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE notifications n
            SET status = $4, bucket_id = $2, modified_at = NOW()
            FROM batch
            WHERE n.id = batch.id
              AND n.status = $3
              AND n.bucket_id = 0
            "#,
        )
        .bind(batch_size as i64)
        .bind(bucket_id)
        .bind(NotificationStatus::Queued.as_str())
        .bind(NotificationStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn fetch_bucket(&self, bucket_id: i64) -> AppResult<Vec<ClaimedNotification>> {
        let rows: Vec<ClaimedNotification> = sqlx::query_as(
            r#"
            SELECT id, recipient_phone, text_body, sender_id, priority, channel_mode,
                   recipient_email, cc_list, subject
            FROM notifications
            WHERE bucket_id = $1 AND status = $2
            ORDER BY id ASC
            "#,
        )
        .bind(bucket_id)
        .bind(NotificationStatus::Processing.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn mark_submitted(&self, bucket_id: i64, update: &SubmittedUpdate) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $3,
                external_id = $4,
                provider_id = $4,
                send_attempts = send_attempts + 1,
                last_message = $5,
                last_error = NULL,
                queued_at = $6,
                modified_at = $6
            WHERE id = $1 AND bucket_id = $2 AND status = $7
            "#,
        )
        .bind(update.id)
        .bind(bucket_id)
        .bind(NotificationStatus::Submitted.as_str())
        .bind(&update.external_id)
        .bind(&update.message)
        .bind(update.at)
        .bind(NotificationStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, bucket_id: i64, update: &FailedUpdate) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $3,
                send_attempts = send_attempts + 1,
                last_error = $4,
                modified_at = $5
            WHERE id = $1 AND bucket_id = $2 AND status = $6
            "#,
        )
        .bind(update.id)
        .bind(bucket_id)
        .bind(NotificationStatus::Retry.as_str())
        .bind(&update.error)
        .bind(update.at)
        .bind(NotificationStatus::Processing.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, bucket_id = 0, modified_at = NOW()
            WHERE status = $2 AND modified_at < $3
            "#,
        )
        .bind(NotificationStatus::Queued.as_str())
        .bind(NotificationStatus::Processing.as_str())
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn requeue_retries(&self, max_attempts: i32) -> AppResult<RequeueCounts> {
        let mut tx = self.pool.begin().await?;

        let requeued = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, bucket_id = 0, modified_at = NOW()
            WHERE status = $2 AND send_attempts < $3
            "#,
        )
        .bind(NotificationStatus::Queued.as_str())
        .bind(NotificationStatus::Retry.as_str())
        .bind(max_attempts)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let exhausted: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE status = $1 AND send_attempts >= $2",
        )
        .bind(NotificationStatus::Retry.as_str())
        .bind(max_attempts)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RequeueCounts {
            requeued,
            exhausted: exhausted as u64,
        })
    }

    async fn last_bucket_id(&self, worker_id: u64) -> AppResult<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(bucket_id) FROM notifications
            WHERE bucket_id > 0 AND ((bucket_id >> $1) & $2) = $3
            "#,
        )
        .bind(idgen::WORKER_SHIFT as i32)
        .bind(idgen::WORKER_MASK as i64)
        .bind(worker_id as i64)
        .fetch_one(&self.pool)
        .await?;

        Ok(max)
    }
}
