//! Fixed-interval trigger for the dispatch pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::pipeline::Pipeline;

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, interval: Duration) -> Self {
        Self { pipeline, interval }
    }

    /// Tick until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Each run executes inline, so this process never overlaps itself; a run
    /// in flight when shutdown arrives is allowed to finish. Ticks missed
    /// during a long run are skipped, not replayed.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Dispatch scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.pipeline.handle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Dispatch scheduler stopped");
    }
}
