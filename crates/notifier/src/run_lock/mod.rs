//! Single-flight run lock.
//!
//! A run holds a time-bounded lease rather than an indefinite lock: a
//! crashed process stops renewing and its lease expires on its own. Every
//! lease carries a random token, and only the holder of that token can
//! extend or release it.

pub mod memory;
pub mod redis_lock;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use ipn_common::error::AppResult;

pub use self::memory::MemoryRunLock;
pub use self::redis_lock::RedisRunLock;

/// A held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub ttl: Duration,
}

impl Lease {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            token: uuid::Uuid::new_v4().to_string(),
            ttl,
        }
    }
}

#[async_trait]
pub trait RunLock: Send + Sync {
    /// Acquire `key` for `ttl`, or `None` if another holder has it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> AppResult<Option<Lease>>;

    /// Push the lease's expiry out by its ttl. `false` if it was lost.
    async fn extend(&self, lease: &Lease) -> AppResult<bool>;

    /// Give the lease up. `false` if it had already expired or been taken.
    async fn release(&self, lease: &Lease) -> AppResult<bool>;
}

/// Extends a lease every `ttl / 3` until dropped.
pub struct Heartbeat {
    handle: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl Heartbeat {
    pub fn start(run_lock: Arc<dyn RunLock>, lease: Lease) -> Self {
        let period = (lease.ttl / 3).max(Duration::from_millis(10));
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match run_lock.extend(&lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        flag.store(true, Ordering::SeqCst);
                        tracing::warn!(key = %lease.key, "Lease lost, renewal stopped");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(key = %lease.key, error = %e, "Failed to extend lease");
                    }
                }
            }
        });
        Self { handle, lost }
    }

    /// Whether a renewal found the lease expired or taken.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
