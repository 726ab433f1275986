//! Bucket id minting.
//!
//! Bucket ids are ferroid snowflakes with a 1/45/2/16 layout, high bits
//! first:
//!
//! ```text
//!  Bit Index:  63           63 62            18 17             16 15             0
//!              +--------------+----------------+-----------------+---------------+
//!  Field:      | reserved (1) | timestamp (45) | worker id (2)   | sequence (16) |
//!              +--------------+----------------+-----------------+---------------+
//! ```
//!
//! The reserved bit stays clear so every id fits a positive Postgres
//! `BIGINT`. Worker ids are leased from a [`RunLock`] so two live
//! replicas never mint with the same worker bits.

use std::sync::Arc;
use std::time::Duration;

use ferroid::define_snowflake_id;
use ferroid::futures::SnowflakeGeneratorAsyncTokioExt;
use ferroid::generator::LockSnowflakeGenerator;
use ferroid::time::TimeSource;

use ipn_common::error::{AppError, AppResult};

use crate::run_lock::{Heartbeat, Lease, RunLock};

/// Bit offset of the worker id field.
pub const WORKER_SHIFT: u32 = 16;

/// Mask of the worker id field once shifted down.
pub const WORKER_MASK: u64 = 0b11;

/// Lease key prefix for worker slots; slot `n` lives at `idgen:worker:<n>`.
const WORKER_SLOT_PREFIX: &str = "idgen:worker:";

define_snowflake_id!(
    BucketId, u64,
    reserved: 1,
    timestamp: 45,
    machine_id: 2,
    sequence: 16
);

/// Fields of a bucket id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    pub timestamp: u64,
    pub worker_id: u64,
    pub sequence: u64,
}

/// Split a bucket id into its fields.
pub fn decompose(id: i64) -> IdParts {
    let id = BucketId::from_raw(id as u64);
    IdParts {
        timestamp: id.timestamp(),
        worker_id: id.machine_id(),
        sequence: id.sequence(),
    }
}

pub fn max_worker_id() -> u64 {
    BucketId::max_machine_id()
}

/// Type-erased time source so the generator is not generic over its clock.
#[derive(Clone)]
struct SharedClock(Arc<dyn TimeSource<u64> + Send + Sync>);

impl TimeSource<u64> for SharedClock {
    fn current_millis(&self) -> u64 {
        self.0.current_millis()
    }
}

/// Lock-based bucket id generator, safe to share across tasks.
pub struct IdGenerator {
    worker_id: u64,
    inner: LockSnowflakeGenerator<BucketId, SharedClock>,
}

impl IdGenerator {
    pub fn new<C>(worker_id: u64, clock: C) -> AppResult<Self>
    where
        C: TimeSource<u64> + Send + Sync + 'static,
    {
        check_worker_id(worker_id)?;
        Ok(Self {
            worker_id,
            inner: LockSnowflakeGenerator::new(worker_id, SharedClock(Arc::new(clock))),
        })
    }

    /// Continue after `last_id`, the newest bucket this worker issued, so a
    /// restart inside the same millisecond never re-issues it.
    pub fn resume_after<C>(worker_id: u64, last_id: i64, clock: C) -> AppResult<Self>
    where
        C: TimeSource<u64> + Send + Sync + 'static,
    {
        check_worker_id(worker_id)?;
        let last = decompose(last_id);
        if last.worker_id != worker_id {
            return Err(AppError::IdGen(format!(
                "bucket {last_id} belongs to worker {}, not {worker_id}",
                last.worker_id
            )));
        }
        Ok(Self {
            worker_id,
            inner: LockSnowflakeGenerator::from_components(
                last.timestamp,
                worker_id,
                last.sequence,
                SharedClock(Arc::new(clock)),
            ),
        })
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Issue the next bucket id, waiting for the next tick if the sequence
    /// for the current millisecond is spent.
    pub async fn next(&self) -> AppResult<i64> {
        let id = self
            .inner
            .try_next_id_async()
            .await
            .map_err(|e| AppError::IdGen(e.to_string()))?;
        i64::try_from(id.to_raw())
            .map_err(|_| AppError::IdGen(format!("bucket id {id} overflows BIGINT")))
    }
}

fn check_worker_id(worker_id: u64) -> AppResult<()> {
    if worker_id > max_worker_id() {
        return Err(AppError::IdGen(format!(
            "worker id {worker_id} exceeds maximum {}",
            max_worker_id()
        )));
    }
    Ok(())
}

fn worker_slot_key(worker_id: u64) -> String {
    format!("{WORKER_SLOT_PREFIX}{worker_id}")
}

/// Exclusive claim on a worker id, renewed in the background until released.
pub struct WorkerLease {
    worker_id: u64,
    lease: Lease,
    lock: Arc<dyn RunLock>,
    heartbeat: Heartbeat,
}

impl WorkerLease {
    /// Lease the first free worker slot, or exactly `pinned` when set.
    ///
    /// Fails when every candidate slot is held by a live replica.
    pub async fn acquire(
        lock: Arc<dyn RunLock>,
        pinned: Option<u64>,
        ttl: Duration,
    ) -> AppResult<Self> {
        let candidates = match pinned {
            Some(worker_id) => {
                check_worker_id(worker_id)?;
                worker_id..=worker_id
            }
            None => 0..=max_worker_id(),
        };

        for worker_id in candidates {
            if let Some(lease) = lock.try_acquire(&worker_slot_key(worker_id), ttl).await? {
                tracing::info!(worker_id, key = %lease.key, "Leased worker id");
                let heartbeat = Heartbeat::start(lock.clone(), lease.clone());
                return Ok(Self {
                    worker_id,
                    lease,
                    lock,
                    heartbeat,
                });
            }
        }

        Err(match pinned {
            Some(worker_id) => AppError::IdGen(format!("worker id {worker_id} is leased elsewhere")),
            None => AppError::IdGen(format!(
                "all {} worker ids are leased",
                max_worker_id() + 1
            )),
        })
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// `false` once a renewal found the slot taken or expired.
    pub fn is_held(&self) -> bool {
        !self.heartbeat.is_lost()
    }

    pub async fn release(self) -> AppResult<bool> {
        let Self {
            lease,
            lock,
            heartbeat,
            ..
        } = self;
        drop(heartbeat);
        lock.release(&lease).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    use ferroid::time::MonotonicClock;

    use super::*;
    use crate::run_lock::MemoryRunLock;

    /// Clock pinned to a settable millisecond.
    #[derive(Clone, Default)]
    struct MockTime {
        millis: Arc<AtomicU64>,
    }

    impl MockTime {
        fn at(millis: u64) -> Self {
            Self {
                millis: Arc::new(AtomicU64::new(millis)),
            }
        }

        fn advance(&self, millis: u64) {
            self.millis.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl TimeSource<u64> for MockTime {
        fn current_millis(&self) -> u64 {
            self.millis.load(Ordering::SeqCst)
        }
    }

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_field_offsets() {
        let id = BucketId::from_components(1, 1, 1).to_raw();
        assert_eq!(id, (1 << 18) | (1 << WORKER_SHIFT) | 1);

        let max = BucketId::from_components(
            BucketId::max_timestamp(),
            BucketId::max_machine_id(),
            BucketId::max_sequence(),
        )
        .to_raw();
        assert_eq!(max, i64::MAX as u64);
        assert_eq!((max >> WORKER_SHIFT) & WORKER_MASK, max_worker_id());
    }

    #[test]
    fn test_worker_id_must_fit() {
        assert!(IdGenerator::new(3, MockTime::at(0)).is_ok());
        assert!(IdGenerator::new(4, MockTime::at(0)).is_err());
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let clock = MockTime::at(1_000);
        let idgen = IdGenerator::new(1, clock.clone()).unwrap();

        let mut last = 0;
        for step in 0..50 {
            if step % 7 == 0 {
                clock.advance(1);
            }
            let id = idgen.next().await.unwrap();
            assert!(id > last, "id {id} not greater than {last}");
            last = id;
        }
    }

    #[tokio::test]
    async fn test_fields_decompose() {
        let idgen = IdGenerator::new(2, MockTime::at(123_456)).unwrap();
        let first = idgen.next().await.unwrap();
        let second = idgen.next().await.unwrap();

        let parts = decompose(second);
        assert_eq!(parts.timestamp, 123_456);
        assert_eq!(parts.worker_id, 2);
        assert_eq!(parts.sequence, decompose(first).sequence + 1);
    }

    #[tokio::test]
    async fn test_distinct_workers_never_collide() {
        let clock = MockTime::at(42);
        let a = IdGenerator::new(0, clock.clone()).unwrap();
        let b = IdGenerator::new(1, clock).unwrap();

        let mut seen = HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(a.next().await.unwrap()));
            assert!(seen.insert(b.next().await.unwrap()));
        }
    }

    #[tokio::test]
    async fn test_resume_after_same_millisecond() {
        let clock = MockTime::at(900);
        let first_run = IdGenerator::new(1, clock.clone()).unwrap();
        let last = first_run.next().await.unwrap();
        drop(first_run);

        let restarted = IdGenerator::resume_after(1, last, clock).unwrap();
        let next = restarted.next().await.unwrap();
        assert!(next > last);
        assert_eq!(decompose(next).timestamp, 900);
    }

    #[tokio::test]
    async fn test_resume_rejects_other_workers_bucket() {
        let clock = MockTime::at(900);
        let foreign = IdGenerator::new(3, clock.clone()).unwrap().next().await.unwrap();
        assert!(IdGenerator::resume_after(1, foreign, clock).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_ids_unique() {
        let idgen = Arc::new(IdGenerator::new(0, MonotonicClock::default()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let idgen = idgen.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::with_capacity(4096);
                for _ in 0..4096 {
                    ids.push(idgen.next().await.unwrap());
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8 * 4096);
    }

    #[tokio::test]
    async fn test_worker_slots_fill_then_refuse() {
        let lock: Arc<dyn RunLock> = Arc::new(MemoryRunLock::new());

        let mut leases = Vec::new();
        for expected in 0..=max_worker_id() {
            let lease = WorkerLease::acquire(lock.clone(), None, TTL).await.unwrap();
            assert_eq!(lease.worker_id(), expected);
            leases.push(lease);
        }
        assert!(matches!(
            WorkerLease::acquire(lock.clone(), None, TTL).await,
            Err(AppError::IdGen(_))
        ));

        let freed = leases.remove(1);
        assert!(freed.release().await.unwrap());
        let reused = WorkerLease::acquire(lock, None, TTL).await.unwrap();
        assert_eq!(reused.worker_id(), 1);
    }

    #[tokio::test]
    async fn test_pinned_worker_slot() {
        let lock: Arc<dyn RunLock> = Arc::new(MemoryRunLock::new());
        let held = WorkerLease::acquire(lock.clone(), Some(2), TTL).await.unwrap();
        assert_eq!(held.worker_id(), 2);

        assert!(WorkerLease::acquire(lock.clone(), Some(2), TTL).await.is_err());
        assert!(WorkerLease::acquire(lock.clone(), Some(4), TTL).await.is_err());
        assert_eq!(
            WorkerLease::acquire(lock, None, TTL).await.unwrap().worker_id(),
            0
        );
    }

    #[tokio::test]
    async fn test_worker_lease_outlives_ttl() {
        let memory = Arc::new(MemoryRunLock::new());
        let lock: Arc<dyn RunLock> = memory.clone();
        let lease = WorkerLease::acquire(lock, None, Duration::from_millis(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(lease.is_held());
        assert!(memory.is_held(&worker_slot_key(0)));

        assert!(lease.release().await.unwrap());
        assert!(!memory.is_held(&worker_slot_key(0)));
    }
}
