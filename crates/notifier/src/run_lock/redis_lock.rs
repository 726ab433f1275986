use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;

use ipn_common::error::AppResult;

use super::{Lease, RunLock};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Redis lease lock built on `SET NX PX` and token-checked scripts.
#[derive(Clone)]
pub struct RedisRunLock {
    redis: ConnectionManager,
    prefix: String,
    release: Script,
    extend: Script,
}

impl RedisRunLock {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_prefix(redis, "ipn:lock:")
    }

    /// Lock whose keys live under `prefix` instead of `ipn:lock:`.
    pub fn with_prefix(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl RunLock for RedisRunLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> AppResult<Option<Lease>> {
        let lease = Lease::new(self.redis_key(key), ttl);
        let mut conn = self.redis.clone();

        // SET key token NX PX ttl
        // Returns Some("OK") if the key was set, None if another holder has it
        let result: Option<String> = redis::cmd("SET")
            .arg(&lease.key)
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|_| lease))
    }

    async fn extend(&self, lease: &Lease) -> AppResult<bool> {
        let mut conn = self.redis.clone();
        let extended: i64 = self
            .extend
            .key(&lease.key)
            .arg(&lease.token)
            .arg(ttl_millis(lease.ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, lease: &Lease) -> AppResult<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .release
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}
