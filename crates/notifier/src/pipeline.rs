//! Claim → dispatch → reconcile pipeline.
//!
//! One pass:
//! 1. Acquire the run lease (single-flight across replicas)
//! 2. Mint a bucket id and claim a batch into it (`BatchClaimer`)
//! 3. Send every claimed notification (`Dispatcher`)
//! 4. Write outcomes back (`Reconciler`)

use std::sync::Arc;
use std::time::Duration;

use ipn_common::config::AppConfig;

use crate::claimer::{BatchClaimer, Claim};
use crate::dispatcher::Dispatcher;
use crate::gateway::Gateway;
use crate::idgen::IdGenerator;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::run_lock::{Heartbeat, RunLock};
use crate::store::NotificationStore;

/// Lease name shared by every replica running the dispatch pipeline.
pub const DISPATCH_LOCK_KEY: &str = "notification-dispatch";

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub batch_size: u32,
    pub dispatch_concurrency: usize,
    pub lock_key: String,
    pub lock_ttl: Duration,
}

impl PipelineOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            dispatch_concurrency: config.dispatch_concurrency,
            lock_key: DISPATCH_LOCK_KEY.to_string(),
            lock_ttl: config.run_lock_ttl(),
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            dispatch_concurrency: 8,
            lock_key: DISPATCH_LOCK_KEY.to_string(),
            lock_ttl: Duration::from_secs(300),
        }
    }
}

/// Summary of a completed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub bucket_id: i64,
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub reconcile: ReconcileReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run holds the lease.
    Locked,
    /// Nothing was eligible.
    Empty,
    /// Rows were claimed but could not be fetched; they stay in `processing`.
    Stalled { bucket_id: i64, claimed: u64 },
    Completed(RunReport),
}

pub struct Pipeline {
    idgen: Arc<IdGenerator>,
    claimer: BatchClaimer,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    run_lock: Arc<dyn RunLock>,
    lock_key: String,
    lock_ttl: Duration,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        gateway: Arc<dyn Gateway>,
        idgen: Arc<IdGenerator>,
        run_lock: Arc<dyn RunLock>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            idgen,
            claimer: BatchClaimer::new(store.clone(), options.batch_size),
            dispatcher: Dispatcher::new(gateway, options.dispatch_concurrency),
            reconciler: Reconciler::new(store),
            run_lock,
            lock_key: options.lock_key,
            lock_ttl: options.lock_ttl,
        }
    }

    /// Scheduled entry point. Never fails; errors end up in the log.
    pub async fn handle(&self) {
        match self.run_once().await {
            Ok(RunOutcome::Locked) => {
                tracing::debug!("Dispatch run skipped, lease held elsewhere");
            }
            Ok(RunOutcome::Empty) => {}
            Ok(RunOutcome::Stalled { bucket_id, claimed }) => {
                tracing::warn!(bucket_id, claimed, "Dispatch run stalled after claim");
            }
            Ok(RunOutcome::Completed(report)) => {
                tracing::info!(
                    bucket_id = report.bucket_id,
                    fetched = report.fetched,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    skipped = report.skipped,
                    submitted = report.reconcile.submitted,
                    retried = report.reconcile.retried,
                    lost = report.reconcile.lost,
                    reconcile_errors = report.reconcile.errors,
                    "Dispatch run completed"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Dispatch run failed");
            }
        }
    }

    /// One full pass under the run lease.
    pub async fn run_once(&self) -> anyhow::Result<RunOutcome> {
        let Some(lease) = self
            .run_lock
            .try_acquire(&self.lock_key, self.lock_ttl)
            .await?
        else {
            return Ok(RunOutcome::Locked);
        };

        let heartbeat = Heartbeat::start(self.run_lock.clone(), lease.clone());
        let result = self.run_locked().await;
        drop(heartbeat);

        match self.run_lock.release(&lease).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(key = %lease.key, "Run lease expired before release"),
            Err(e) => tracing::warn!(key = %lease.key, error = %e, "Failed to release run lease"),
        }

        result
    }

    async fn run_locked(&self) -> anyhow::Result<RunOutcome> {
        let bucket_id = self.idgen.next().await?;

        let notifications = match self.claimer.claim(bucket_id).await? {
            Claim::Empty => return Ok(RunOutcome::Empty),
            Claim::Missing { claimed } => return Ok(RunOutcome::Stalled { bucket_id, claimed }),
            Claim::Ready(notifications) => notifications,
        };

        let fetched = notifications.len();
        let dispatch = self.dispatcher.dispatch(notifications).await;
        let reconcile = self.reconciler.reconcile(bucket_id, &dispatch).await;

        Ok(RunOutcome::Completed(RunReport {
            bucket_id,
            fetched,
            succeeded: dispatch.succeeded.len(),
            failed: dispatch.failed.len(),
            skipped: dispatch.skipped,
            reconcile,
        }))
    }
}
