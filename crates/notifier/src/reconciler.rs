//! Outcome reconciler: writes dispatch results back to the store.

use std::sync::Arc;

use chrono::Utc;

use crate::dispatcher::{Delivery, DispatchReport};
use crate::store::{FailedUpdate, NotificationStore, SubmittedUpdate};

/// Fallback error text when the gateway reported failure without a message.
const UNKNOWN_FAILURE: &str = "gateway reported failure without a message";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rows moved to `submitted`.
    pub submitted: usize,
    /// Rows moved to `retry`.
    pub retried: usize,
    /// Rows no longer owned by the bucket when the write arrived.
    pub lost: usize,
    /// Rows whose write failed with a store error.
    pub errors: usize,
}

pub struct Reconciler {
    store: Arc<dyn NotificationStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// Persist every outcome in `report`. Per-row failures are logged and
    /// skipped; the bucket id is left on the rows for audit.
    pub async fn reconcile(&self, bucket_id: i64, report: &DispatchReport) -> ReconcileReport {
        let mut summary = ReconcileReport::default();

        for delivery in &report.succeeded {
            let update = SubmittedUpdate {
                id: delivery.id,
                external_id: delivery.external_id.clone(),
                message: delivery.message.clone(),
                at: Utc::now(),
            };
            match self.store.mark_submitted(bucket_id, &update).await {
                Ok(true) => summary.submitted += 1,
                Ok(false) => {
                    tracing::warn!(
                        bucket_id,
                        notification_id = delivery.id,
                        "Submitted notification no longer owned by bucket"
                    );
                    summary.lost += 1;
                }
                Err(e) => {
                    tracing::error!(
                        bucket_id,
                        notification_id = delivery.id,
                        external_id = delivery.external_id.as_deref().unwrap_or_default(),
                        error = %e,
                        "Error updating successfully queued notification"
                    );
                    summary.errors += 1;
                }
            }
        }

        if !report.failed.is_empty() {
            tracing::error!(
                bucket_id,
                failed = %failed_summary(&report.failed),
                "Failed notifications in bucket"
            );
        }

        for delivery in &report.failed {
            let update = FailedUpdate {
                id: delivery.id,
                error: delivery
                    .message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| UNKNOWN_FAILURE.to_string()),
                at: Utc::now(),
            };
            match self.store.mark_failed(bucket_id, &update).await {
                Ok(true) => summary.retried += 1,
                Ok(false) => {
                    tracing::warn!(
                        bucket_id,
                        notification_id = delivery.id,
                        "Failed notification no longer owned by bucket"
                    );
                    summary.lost += 1;
                }
                Err(e) => {
                    tracing::error!(
                        bucket_id,
                        notification_id = delivery.id,
                        reason = %update.error,
                        error = %e,
                        "Error updating failed notification"
                    );
                    summary.errors += 1;
                }
            }
        }

        summary
    }
}

fn failed_summary(failed: &[Delivery]) -> String {
    serde_json::to_string(failed).unwrap_or_else(|_| format!("{} deliveries", failed.len()))
}
