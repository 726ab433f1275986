use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use ipn_common::error::AppResult;

use super::{Lease, RunLock};

#[derive(Debug)]
struct Held {
    token: String,
    expires_at: Instant,
}

/// In-process lease lock.
#[derive(Debug, Default)]
pub struct MemoryRunLock {
    leases: Mutex<HashMap<String, Held>>,
}

impl MemoryRunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held by anyone.
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .lock()
            .get(key)
            .is_some_and(|held| held.expires_at > Instant::now())
    }
}

#[async_trait]
impl RunLock for MemoryRunLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> AppResult<Option<Lease>> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if leases.get(key).is_some_and(|held| held.expires_at > now) {
            return Ok(None);
        }

        let lease = Lease::new(key, ttl);
        leases.insert(
            key.to_string(),
            Held {
                token: lease.token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(lease))
    }

    async fn extend(&self, lease: &Lease) -> AppResult<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(&lease.key) {
            Some(held) if held.token == lease.token && held.expires_at > now => {
                held.expires_at = now + lease.ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lease: &Lease) -> AppResult<bool> {
        let mut leases = self.leases.lock();
        let owned = leases
            .get(&lease.key)
            .is_some_and(|held| held.token == lease.token && held.expires_at > Instant::now());
        if owned {
            leases.remove(&lease.key);
        }
        Ok(owned)
    }
}
