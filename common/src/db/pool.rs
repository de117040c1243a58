// Keyed pool of expiring database connections
// One FIFO partition per DSN; idle connections are recycled after a fixed interval

use crate::config::PoolSettings;
use crate::db::connection::{Connector, DbConnection};
use crate::dsn::Dsn;
use crate::errors::DatabaseError;
use crate::telemetry;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Pool tuning
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long a released connection stays reusable
    pub recycle_after: Duration,
    /// Maximum connections checked out per DSN at once; `None` never waits
    pub max_connections_per_dsn: Option<usize>,
    /// How long `acquire` waits for a free slot when bounded
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            recycle_after: Duration::from_secs(600),
            max_connections_per_dsn: None,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            recycle_after: settings.recycle_after(),
            max_connections_per_dsn: settings.max_connections_per_dsn.map(|n| n as usize),
            acquire_timeout: settings.acquire_timeout(),
        }
    }
}

/// Snapshot of pool activity since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Physical connections opened
    pub created: u64,
    /// Acquisitions served from an idle connection
    pub reused: u64,
    /// Idle connections closed because their deadline had passed
    pub expired: u64,
    /// Borrowed connections dropped instead of released
    pub discarded: u64,
    /// Idle connections currently queued across all partitions
    pub idle: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    expired: AtomicU64,
    discarded: AtomicU64,
}

/// A connection borrowed from the pool
///
/// Hand it back with [`ConnectionPool::release`]. The pool-assigned `id`
/// identifies the physical connection across borrows.
pub struct PooledConnection {
    conn: Box<dyn DbConnection>,
    id: u64,
    // Held while borrowed from a bounded partition
    _permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Deref for PooledConnection {
    type Target = dyn DbConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

struct IdleConnection {
    conn: Box<dyn DbConnection>,
    id: u64,
    deadline: Instant,
}

/// Idle queue for one DSN
struct Partition {
    idle: Mutex<VecDeque<IdleConnection>>,
    limiter: Option<Arc<Semaphore>>,
}

impl Partition {
    fn new(limit: Option<usize>) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            limiter: limit.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<IdleConnection>> {
        lock(&self.idle)
    }
}

// A panic while holding a pool lock leaves the queue itself consistent
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connection pool partitioned by DSN
///
/// Construct once per process and share it as `Arc<ConnectionPool>`.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    partitions: Mutex<HashMap<Dsn, Arc<Partition>>>,
    next_id: AtomicU64,
    counters: Counters,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        info!(
            recycle_after_seconds = config.recycle_after.as_secs(),
            max_connections_per_dsn = ?config.max_connections_per_dsn,
            "Initializing connection pool"
        );

        Self {
            connector,
            config,
            partitions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn partition(&self, dsn: &Dsn) -> Arc<Partition> {
        let mut partitions = lock(&self.partitions);
        partitions
            .entry(dsn.clone())
            .or_insert_with(|| Arc::new(Partition::new(self.config.max_connections_per_dsn)))
            .clone()
    }

    /// Borrow a live connection for `dsn`
    ///
    /// Dequeues the oldest idle connection; expired ones are closed and
    /// skipped. When the queue runs dry a new connection is opened. Only a
    /// bounded pool ever waits, and then at most `acquire_timeout`.
    #[instrument(skip(self), fields(dsn = %dsn))]
    pub async fn acquire(&self, dsn: &Dsn) -> Result<PooledConnection, DatabaseError> {
        let partition = self.partition(dsn);

        let permit = match &partition.limiter {
            Some(limiter) => Some(self.wait_for_slot(limiter.clone()).await?),
            None => None,
        };

        loop {
            // Pop under the lock, close outside it
            let next = partition.queue().pop_front();
            let Some(mut idle) = next else { break };

            if idle.deadline > Instant::now() {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                debug!(connection_id = idle.id, "Reusing pooled connection");
                return Ok(PooledConnection {
                    conn: idle.conn,
                    id: idle.id,
                    _permit: permit,
                });
            }

            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            telemetry::record_connection_expired();
            debug!(connection_id = idle.id, "Closing expired connection");
            if let Err(e) = idle.conn.close().await {
                warn!(connection_id = idle.id, error = %e, "Failed to close expired connection");
            }
        }

        let conn = self.connector.connect(dsn).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        telemetry::record_connection_created();
        debug!(connection_id = id, "Opened new connection");

        Ok(PooledConnection {
            conn,
            id,
            _permit: permit,
        })
    }

    async fn wait_for_slot(
        &self,
        limiter: Arc<Semaphore>,
    ) -> Result<OwnedSemaphorePermit, DatabaseError> {
        match tokio::time::timeout(self.config.acquire_timeout, limiter.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(DatabaseError::ConnectionFailed(
                "Connection pool is closed".to_string(),
            )),
            Err(_) => {
                warn!(
                    timeout_seconds = self.config.acquire_timeout.as_secs(),
                    "Timed out waiting for a pooled connection"
                );
                Err(DatabaseError::AcquireTimeout(
                    self.config.acquire_timeout.as_secs(),
                ))
            }
        }
    }

    /// Return a borrowed connection to the tail of its DSN's queue
    ///
    /// The connection becomes reusable until now + `recycle_after`. Never
    /// fails and does not check the connection's health.
    pub fn release(&self, dsn: &Dsn, conn: PooledConnection) {
        let PooledConnection { conn, id, _permit } = conn;
        let deadline = Instant::now() + self.config.recycle_after;

        let idle = {
            let partition = self.partition(dsn);
            let mut queue = partition.queue();
            queue.push_back(IdleConnection { conn, id, deadline });
            queue.len()
        };

        debug!(connection_id = id, idle, "Connection returned to pool");
        telemetry::update_idle_connections(self.idle_total() as i64);
    }

    /// Drop a borrowed connection that must not be reused
    pub fn discard(&self, conn: PooledConnection) {
        let PooledConnection { mut conn, id, _permit } = conn;
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        warn!(connection_id = id, "Discarding connection");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = conn.close().await {
                    debug!(connection_id = id, error = %e, "Close of discarded connection failed");
                }
            });
        }
    }

    /// Number of idle connections queued for `dsn`
    pub fn idle_count(&self, dsn: &Dsn) -> usize {
        let partition = lock(&self.partitions).get(dsn).cloned();
        partition.map(|p| p.queue().len()).unwrap_or(0)
    }

    fn idle_total(&self) -> usize {
        let partitions: Vec<Arc<Partition>> = lock(&self.partitions).values().cloned().collect();
        partitions.iter().map(|p| p.queue().len()).sum()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
            idle: self.idle_total(),
        }
    }

    /// Close every idle connection; borrowed ones are unaffected
    #[instrument(skip(self))]
    pub async fn close_all(&self) {
        info!("Closing idle pooled connections");
        let partitions: Vec<Arc<Partition>> = lock(&self.partitions).values().cloned().collect();

        let mut closed = 0usize;
        for partition in partitions {
            let drained: Vec<IdleConnection> = partition.queue().drain(..).collect();
            for mut idle in drained {
                if let Err(e) = idle.conn.close().await {
                    warn!(connection_id = idle.id, error = %e, "Failed to close connection");
                }
                closed += 1;
            }
        }

        telemetry::update_idle_connections(0);
        info!(closed, "Connection pool drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::value::{Row, Value};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Tally {
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    struct NullConnection {
        tally: Arc<Tally>,
    }

    #[async_trait]
    impl DbConnection for NullConnection {
        async fn begin(&mut self) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn commit(&mut self) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn rollback(&mut self) -> Result<(), DatabaseError> {
            Ok(())
        }
        async fn fetch_all(&mut self, _: &str, _: &[Value]) -> Result<Vec<Row>, DatabaseError> {
            Ok(Vec::new())
        }
        async fn execute(&mut self, _: &str, _: &[Value]) -> Result<u64, DatabaseError> {
            Ok(0)
        }
        async fn close(&mut self) -> Result<(), DatabaseError> {
            self.tally.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullConnector {
        tally: Arc<Tally>,
        fail: bool,
    }

    #[async_trait]
    impl Connector for NullConnector {
        async fn connect(&self, _: &Dsn) -> Result<Box<dyn DbConnection>, DatabaseError> {
            if self.fail {
                return Err(DatabaseError::ConnectionFailed("refused".to_string()));
            }
            self.tally.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullConnection {
                tally: self.tally.clone(),
            }))
        }
    }

    fn pool_with(config: PoolConfig) -> (ConnectionPool, Arc<Tally>) {
        let tally = Arc::new(Tally::default());
        let connector = Arc::new(NullConnector {
            tally: tally.clone(),
            fail: false,
        });
        (ConnectionPool::new(connector, config), tally)
    }

    fn dsn(name: &str) -> Dsn {
        Dsn::new(format!("postgres://u:p@localhost/{}", name))
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_then_acquire_reuses_connection() {
        let (pool, tally) = pool_with(PoolConfig::default());
        let dsn = dsn("a");

        let first = pool.acquire(&dsn).await.unwrap();
        let id = first.id();
        pool.release(&dsn, first);

        tokio::time::advance(Duration::from_secs(599)).await;
        let second = pool.acquire(&dsn).await.unwrap();

        assert_eq!(second.id(), id);
        assert_eq!(tally.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().reused, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_connection_is_closed_and_replaced() {
        let (pool, tally) = pool_with(PoolConfig::default());
        let dsn = dsn("a");

        let first = pool.acquire(&dsn).await.unwrap();
        let id = first.id();
        pool.release(&dsn, first);

        tokio::time::advance(Duration::from_secs(601)).await;
        let second = pool.acquire(&dsn).await.unwrap();

        assert_ne!(second.id(), id);
        assert_eq!(tally.connects.load(Ordering::SeqCst), 2);
        assert_eq!(tally.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().expired, 1);
        assert_eq!(pool.idle_count(&dsn), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_skips_every_expired_entry() {
        let (pool, tally) = pool_with(PoolConfig::default());
        let dsn = dsn("a");

        let a = pool.acquire(&dsn).await.unwrap();
        let b = pool.acquire(&dsn).await.unwrap();
        pool.release(&dsn, a);
        pool.release(&dsn, b);

        tokio::time::advance(Duration::from_secs(700)).await;
        let fresh = pool.acquire(&dsn).await.unwrap();

        assert_eq!(fresh.id(), 3);
        assert_eq!(tally.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let (pool, _) = pool_with(PoolConfig::default());
        let dsn = dsn("a");

        let a = pool.acquire(&dsn).await.unwrap();
        let b = pool.acquire(&dsn).await.unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        pool.release(&dsn, a);
        pool.release(&dsn, b);

        assert_eq!(pool.acquire(&dsn).await.unwrap().id(), a_id);
        assert_eq!(pool.acquire(&dsn).await.unwrap().id(), b_id);
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let (pool, tally) = pool_with(PoolConfig::default());

        let a = pool.acquire(&dsn("a")).await.unwrap();
        pool.release(&dsn("a"), a);
        let b = pool.acquire(&dsn("b")).await.unwrap();

        assert_eq!(b.id(), 2);
        assert_eq!(tally.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(&dsn("a")), 1);
    }

    #[tokio::test]
    async fn test_unbounded_pool_never_waits() {
        let (pool, _) = pool_with(PoolConfig::default());
        let dsn = dsn("a");

        let mut held = Vec::new();
        for _ in 0..50 {
            held.push(pool.acquire(&dsn).await.unwrap());
        }
        assert_eq!(pool.stats().created, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_pool_times_out_when_exhausted() {
        let (pool, _) = pool_with(PoolConfig {
            max_connections_per_dsn: Some(1),
            acquire_timeout: Duration::from_secs(2),
            ..PoolConfig::default()
        });
        let dsn = dsn("a");

        let held = pool.acquire(&dsn).await.unwrap();
        let result = pool.acquire(&dsn).await;
        assert!(matches!(result, Err(DatabaseError::AcquireTimeout(2))));

        pool.release(&dsn, held);
        let again = pool.acquire(&dsn).await.unwrap();
        assert_eq!(again.id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_wakes_bounded_waiter() {
        let (pool, _) = pool_with(PoolConfig {
            max_connections_per_dsn: Some(1),
            acquire_timeout: Duration::from_secs(30),
            ..PoolConfig::default()
        });
        let pool = Arc::new(pool);
        let dsn = dsn("a");

        let held = pool.acquire(&dsn).await.unwrap();
        let held_id = held.id();
        let started = Instant::now();
        let waiter = {
            let pool = pool.clone();
            let dsn = dsn.clone();
            tokio::spawn(async move {
                pool.acquire(&dsn)
                    .await
                    .map(|conn| (conn.id(), Instant::now()))
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        pool.release(&dsn, held);
        let (id, woke_at) = waiter.await.unwrap().unwrap();

        assert_eq!(id, held_id);
        assert!(woke_at - started < Duration::from_secs(30));
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_borrowers_never_share_a_connection() {
        let (pool, tally) = pool_with(PoolConfig::default());
        let pool = Arc::new(pool);
        let borrowed = Arc::new(Mutex::new(HashSet::new()));
        let acquires = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for task in 0..16 {
            let pool = pool.clone();
            let borrowed = borrowed.clone();
            let acquires = acquires.clone();
            tasks.push(tokio::spawn(async move {
                let dsn = dsn(if task % 2 == 0 { "a" } else { "b" });
                for _ in 0..50 {
                    let conn = pool.acquire(&dsn).await.unwrap();
                    acquires.fetch_add(1, Ordering::SeqCst);

                    let fresh = lock(&borrowed).insert(conn.id());
                    assert!(fresh, "connection {} borrowed twice", conn.id());
                    tokio::task::yield_now().await;
                    lock(&borrowed).remove(&conn.id());

                    pool.release(&dsn, conn);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.created + stats.reused, acquires.load(Ordering::SeqCst) as u64);
        assert_eq!(stats.created, tally.connects.load(Ordering::SeqCst) as u64);
        // Each task holds at most one connection at a time
        assert!(stats.created <= 16);
        assert_eq!(stats.idle as u64, stats.created);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bounded_partition_caps_concurrent_borrows() {
        let (pool, _) = pool_with(PoolConfig {
            max_connections_per_dsn: Some(3),
            ..PoolConfig::default()
        });
        let pool = Arc::new(pool);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let dsn = dsn("a");
                for _ in 0..20 {
                    let conn = pool.acquire(&dsn).await.unwrap();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    pool.release(&dsn, conn);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.stats().created <= 3);
        assert_eq!(pool.stats().created + pool.stats().reused, 12 * 20);
    }

    #[tokio::test]
    async fn test_connect_failure_is_a_connection_error() {
        let connector = Arc::new(NullConnector {
            tally: Arc::new(Tally::default()),
            fail: true,
        });
        let pool = ConnectionPool::new(connector, PoolConfig::default());

        let err = pool.acquire(&dsn("a")).await.err().unwrap();
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_discard_does_not_requeue() {
        let (pool, _) = pool_with(PoolConfig::default());
        let dsn = dsn("a");

        let conn = pool.acquire(&dsn).await.unwrap();
        pool.discard(conn);

        assert_eq!(pool.idle_count(&dsn), 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_close_all_drains_idle_connections() {
        let (pool, tally) = pool_with(PoolConfig::default());
        let a = pool.acquire(&dsn("a")).await.unwrap();
        let b = pool.acquire(&dsn("b")).await.unwrap();
        pool.release(&dsn("a"), a);
        pool.release(&dsn("b"), b);

        pool.close_all().await;

        assert_eq!(pool.stats().idle, 0);
        assert_eq!(tally.closes.load(Ordering::SeqCst), 2);
    }
}
