//! # Connection Pool Manager
//!
//! Bounded, blocking pool of store connections.
//!
//! - `acquire()` hands out a [`ConnectionLease`]; when `max_size` leases are
//!   out it waits on a condition variable until one comes back or the
//!   acquire timeout elapses (`PoolExhausted`).
//! - Dropping or releasing a lease returns its connection.
//! - A background thread expires overdue leases, closes idle connections
//!   above `min_size`, evicts connections that fail their health probe and
//!   tops the pool back up to `min_size`.
//! - Idle connections are probed again on checkout, so an unhealthy one is
//!   never handed to a caller.

use crate::config::PoolBounds;
use crate::{StoreKind, TrellisError, TxId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// =============================================================================
// FACTORY
// =============================================================================

/// Opens and probes connections to one store.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn store(&self) -> StoreKind;

    fn connect(&self) -> Result<Self::Connection, TrellisError>;

    /// Cheap liveness probe. A connection that fails is closed, never reused.
    fn is_healthy(&self, conn: &mut Self::Connection) -> bool;
}

/// Timing knobs shared by both pools.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub lease_timeout: Duration,
    pub health_check_interval: Duration,
}

impl PoolSettings {
    #[must_use]
    pub fn from_config(config: &crate::config::PoolConfig) -> Self {
        Self {
            acquire_timeout: config.acquire_timeout(),
            idle_timeout: config.idle_timeout(),
            lease_timeout: config.lease_timeout(),
            health_check_interval: config.health_check_interval(),
        }
    }
}

/// Counters exposed through the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub store: StoreKind,
    pub open: usize,
    pub idle: usize,
    pub leased: usize,
    pub created: u64,
    pub evicted: u64,
    pub idle_closed: u64,
    pub acquire_timeouts: u64,
    pub revoked_leases: u64,
}

// =============================================================================
// SHARED STATE
// =============================================================================

struct IdleConnection<C> {
    conn: C,
    idle_since: Instant,
}

struct LeaseEntry {
    acquired_at: Instant,
    revoked: bool,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    leases: BTreeMap<u64, LeaseEntry>,
    /// Idle plus live leased connections plus connections being opened.
    open: usize,
    next_lease_id: u64,
    closed: bool,
    created: u64,
    evicted: u64,
    idle_closed: u64,
    acquire_timeouts: u64,
    revoked_leases: u64,
}

struct Shared<F: ConnectionFactory> {
    factory: F,
    bounds: PoolBounds,
    settings: PoolSettings,
    state: Mutex<PoolState<F::Connection>>,
    available: Condvar,
}

impl<F: ConnectionFactory> Shared<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!(store = %self.factory.store(), "pool mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Open a connection for a slot already counted in `open`.
    fn open_counted(&self) -> Result<F::Connection, TrellisError> {
        match self.factory.connect() {
            Ok(conn) => {
                self.lock().created += 1;
                Ok(conn)
            }
            Err(e) => {
                let mut state = self.lock();
                state.open = state.open.saturating_sub(1);
                drop(state);
                self.available.notify_one();
                Err(e)
            }
        }
    }

    fn return_connection(&self, lease_id: u64, conn: F::Connection) {
        let store = self.factory.store();
        let mut state = self.lock();
        match state.leases.remove(&lease_id) {
            Some(entry) if !entry.revoked && !state.closed => {
                state.idle.push_back(IdleConnection {
                    conn,
                    idle_since: Instant::now(),
                });
                drop(state);
                self.available.notify_one();
            }
            Some(entry) if entry.revoked => {
                // slot was already reclaimed when the lease expired
                tracing::warn!(%store, lease_id, "expired lease returned; closing its connection");
            }
            Some(_) => {
                state.open = state.open.saturating_sub(1);
            }
            None => {
                tracing::error!(%store, lease_id, "returned lease is unknown to the pool");
            }
        }
    }

    /// One maintenance pass: expire leases, close idle surplus, evict
    /// unhealthy connections, refill to `min_size`.
    fn maintain(&self) {
        let store = self.factory.store();
        let candidates = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let lease_timeout = self.settings.lease_timeout;
            let mut expired = 0;
            for (lease_id, entry) in &mut state.leases {
                if !entry.revoked && entry.acquired_at.elapsed() > lease_timeout {
                    entry.revoked = true;
                    expired += 1;
                    tracing::warn!(%store, lease_id, "lease exceeded its timeout and was revoked");
                }
            }
            state.open = state.open.saturating_sub(expired);
            state.revoked_leases += expired as u64;
            std::mem::take(&mut state.idle)
        };

        let mut survivors = VecDeque::with_capacity(candidates.len());
        let mut idle_closed = 0u64;
        let mut evicted = 0u64;
        let mut open_after_close = self.lock().open;
        for mut idle in candidates {
            if idle.idle_since.elapsed() > self.settings.idle_timeout
                && open_after_close > self.bounds.min_size
            {
                open_after_close -= 1;
                idle_closed += 1;
            } else if self.factory.is_healthy(&mut idle.conn) {
                survivors.push_back(idle);
            } else {
                open_after_close = open_after_close.saturating_sub(1);
                evicted += 1;
            }
        }

        let refill = {
            let mut state = self.lock();
            state.open = state
                .open
                .saturating_sub((idle_closed + evicted) as usize);
            state.idle_closed += idle_closed;
            state.evicted += evicted;
            // acquirers may have returned connections meanwhile
            survivors.extend(state.idle.drain(..));
            state.idle = survivors;
            let refill = self.bounds.min_size.saturating_sub(state.open);
            state.open += refill;
            refill
        };
        self.available.notify_all();

        if evicted > 0 || idle_closed > 0 {
            tracing::debug!(%store, evicted, idle_closed, "pool maintenance closed connections");
        }

        for _ in 0..refill {
            match self.open_counted() {
                Ok(conn) => {
                    self.lock().idle.push_back(IdleConnection {
                        conn,
                        idle_since: Instant::now(),
                    });
                    self.available.notify_one();
                }
                Err(e) => {
                    tracing::warn!(%store, error = %e, "could not refill pool to min_size");
                    break;
                }
            }
        }
    }
}

// =============================================================================
// POOL
// =============================================================================

struct HealthChecker {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// A bounded pool of connections produced by `F`.
pub struct Pool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    health: Mutex<Option<HealthChecker>>,
}

impl<F: ConnectionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("store", &self.shared.factory.store())
            .field("bounds", &self.shared.bounds)
            .finish()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool and open `min_size` connections up front.
    pub fn new(factory: F, bounds: PoolBounds, settings: PoolSettings) -> Result<Self, TrellisError> {
        if bounds.max_size == 0 || bounds.min_size > bounds.max_size {
            return Err(TrellisError::Config(format!(
                "invalid {} pool bounds: min {} max {}",
                factory.store(),
                bounds.min_size,
                bounds.max_size
            )));
        }
        let mut idle = VecDeque::with_capacity(bounds.max_size);
        for _ in 0..bounds.min_size {
            idle.push_back(IdleConnection {
                conn: factory.connect()?,
                idle_since: Instant::now(),
            });
        }
        let state = PoolState {
            open: idle.len(),
            created: idle.len() as u64,
            idle,
            leases: BTreeMap::new(),
            next_lease_id: 1,
            closed: false,
            evicted: 0,
            idle_closed: 0,
            acquire_timeouts: 0,
            revoked_leases: 0,
        };
        tracing::info!(
            store = %factory.store(),
            min = bounds.min_size,
            max = bounds.max_size,
            "connection pool ready"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                bounds,
                settings,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
            health: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn store(&self) -> StoreKind {
        self.shared.factory.store()
    }

    #[must_use]
    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Acquire with the configured timeout.
    pub fn acquire(&self, owner: Option<TxId>) -> Result<ConnectionLease<F>, TrellisError> {
        self.acquire_timeout(owner, self.shared.settings.acquire_timeout)
    }

    /// Acquire, blocking for at most `timeout`.
    pub fn acquire_timeout(
        &self,
        owner: Option<TxId>,
        timeout: Duration,
    ) -> Result<ConnectionLease<F>, TrellisError> {
        let shared = &self.shared;
        let store = shared.factory.store();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = shared.lock();
        loop {
            if state.closed {
                return Err(TrellisError::Storage {
                    store,
                    message: "pool is shut down".to_string(),
                });
            }

            if let Some(mut idle) = state.idle.pop_front() {
                drop(state);
                if shared.factory.is_healthy(&mut idle.conn) {
                    return Ok(self.register(idle.conn, owner));
                }
                tracing::warn!(%store, "evicting unhealthy connection at checkout");
                state = shared.lock();
                state.open = state.open.saturating_sub(1);
                state.evicted += 1;
                continue;
            }

            if state.open < shared.bounds.max_size {
                state.open += 1;
                drop(state);
                let conn = shared.open_counted()?;
                return Ok(self.register(conn, owner));
            }

            let now = Instant::now();
            if now >= deadline {
                state.acquire_timeouts += 1;
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(%store, waited_ms, "connection pool exhausted");
                return Err(TrellisError::PoolExhausted { store, waited_ms });
            }
            state = match shared.available.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn register(&self, conn: F::Connection, owner_tx: Option<TxId>) -> ConnectionLease<F> {
        let mut state = self.shared.lock();
        let id = state.next_lease_id;
        state.next_lease_id += 1;
        let acquired_at = Instant::now();
        state.leases.insert(
            id,
            LeaseEntry {
                acquired_at,
                revoked: false,
            },
        );
        drop(state);
        tracing::trace!(store = %self.store(), lease_id = id, "lease acquired");
        ConnectionLease {
            shared: Arc::clone(&self.shared),
            id,
            owner_tx,
            acquired_at: Utc::now(),
            conn: Some(conn),
        }
    }

    /// Run one maintenance pass now, then probe a fresh connection.
    pub fn health_check(&self) -> bool {
        self.shared.maintain();
        match self.shared.factory.connect() {
            Ok(mut probe) => self.shared.factory.is_healthy(&mut probe),
            Err(e) => {
                tracing::warn!(store = %self.store(), error = %e, "health probe failed to connect");
                false
            }
        }
    }

    /// Start the background maintenance thread. Idempotent.
    pub fn start_health_checks(&self) -> Result<(), TrellisError> {
        let mut health = match self.health.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if health.is_some() {
            return Ok(());
        }
        let (stop, stopped) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let interval = shared.settings.health_check_interval;
        let handle = std::thread::Builder::new()
            .name(format!("{}-pool-health", shared.factory.store()))
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => shared.maintain(),
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        *health = Some(HealthChecker { stop, handle });
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            store: self.store(),
            open: state.open,
            idle: state.idle.len(),
            leased: state.leases.values().filter(|l| !l.revoked).count(),
            created: state.created,
            evicted: state.evicted,
            idle_closed: state.idle_closed,
            acquire_timeouts: state.acquire_timeouts,
            revoked_leases: state.revoked_leases,
        }
    }

    /// Stop health checks, close idle connections and fail future acquires.
    pub fn shutdown(&self) {
        let checker = match self.health.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(checker) = checker {
            let _ = checker.stop.send(());
            if checker.handle.join().is_err() {
                tracing::error!(store = %self.store(), "pool health thread panicked");
            }
        }
        let mut state = self.shared.lock();
        if !state.closed {
            state.closed = true;
            let idle = state.idle.len();
            state.idle.clear();
            state.open = state.open.saturating_sub(idle);
            tracing::info!(store = %self.store(), "connection pool shut down");
        }
        drop(state);
        self.shared.available.notify_all();
    }
}

impl<F: ConnectionFactory> Drop for Pool<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// LEASE
// =============================================================================

/// Exclusive, single-owner use of one pooled connection.
///
/// Dropping the lease returns the connection. [`ConnectionLease::release`]
/// additionally checks that the caller is the owner.
pub struct ConnectionLease<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    id: u64,
    owner_tx: Option<TxId>,
    acquired_at: DateTime<Utc>,
    conn: Option<F::Connection>,
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionLease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("store", &self.store())
            .field("id", &self.id)
            .field("owner_tx", &self.owner_tx)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

/// A rejected release. The lease is handed back when it is still valid.
pub struct ReleaseError<F: ConnectionFactory> {
    pub error: TrellisError,
    pub lease: Option<ConnectionLease<F>>,
}

impl<F: ConnectionFactory> fmt::Debug for ReleaseError<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseError")
            .field("error", &self.error)
            .field("lease", &self.lease)
            .finish()
    }
}

impl<F: ConnectionFactory> From<ReleaseError<F>> for TrellisError {
    fn from(e: ReleaseError<F>) -> Self {
        e.error
    }
}

impl<F: ConnectionFactory> ConnectionLease<F> {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn store(&self) -> StoreKind {
        self.shared.factory.store()
    }

    #[must_use]
    pub fn owner_tx(&self) -> Option<TxId> {
        self.owner_tx
    }

    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    fn violation(&self, reason: impl Into<String>) -> TrellisError {
        TrellisError::LeaseViolation {
            store: self.store(),
            lease_id: self.id,
            reason: reason.into(),
        }
    }

    /// Whether the pool has revoked this lease for exceeding its timeout.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.shared
            .lock()
            .leases
            .get(&self.id)
            .is_none_or(|entry| entry.revoked)
    }

    /// The leased connection. Fails once the lease has been revoked.
    pub fn connection(&mut self) -> Result<&mut F::Connection, TrellisError> {
        if self.is_revoked() {
            return Err(self.violation("used after lease timeout"));
        }
        let id = self.id;
        let store = self.store();
        self.conn.as_mut().ok_or(TrellisError::LeaseViolation {
            store,
            lease_id: id,
            reason: "used after release".to_string(),
        })
    }

    /// Return the connection, checking ownership.
    ///
    /// A release by anyone but the acquiring owner is refused and the lease
    /// is handed back untouched. Releasing a revoked lease reports the
    /// violation and closes the connection.
    pub fn release(self, owner: Option<TxId>) -> Result<(), ReleaseError<F>> {
        if owner != self.owner_tx {
            let error = self.violation(format!(
                "released by {} but owned by {}",
                describe_owner(owner),
                describe_owner(self.owner_tx)
            ));
            tracing::error!(store = %self.store(), lease_id = self.id, "{error}");
            return Err(ReleaseError {
                error,
                lease: Some(self),
            });
        }
        if self.is_revoked() {
            let error = self.violation("released after lease timeout");
            drop(self);
            return Err(ReleaseError { error, lease: None });
        }
        Ok(())
    }
}

fn describe_owner(owner: Option<TxId>) -> String {
    owner.map_or_else(|| "no transaction".to_string(), |tx| format!("tx {tx}"))
}

impl<F: ConnectionFactory> Drop for ConnectionLease<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.return_connection(self.id, conn);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeConn {
        serial: usize,
        healthy: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct FakeFactory {
        opened: AtomicUsize,
        healthy: Arc<AtomicBool>,
    }

    impl ConnectionFactory for FakeFactory {
        type Connection = FakeConn;

        fn store(&self) -> StoreKind {
            StoreKind::Relational
        }

        fn connect(&self) -> Result<FakeConn, TrellisError> {
            Ok(FakeConn {
                serial: self.opened.fetch_add(1, Ordering::SeqCst),
                healthy: Arc::clone(&self.healthy),
            })
        }

        fn is_healthy(&self, conn: &mut FakeConn) -> bool {
            conn.healthy.load(Ordering::SeqCst)
        }
    }

    fn settings(acquire_ms: u64) -> PoolSettings {
        PoolSettings {
            acquire_timeout: Duration::from_millis(acquire_ms),
            idle_timeout: Duration::from_secs(60),
            lease_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(60),
        }
    }

    fn pool(min: usize, max: usize, acquire_ms: u64) -> Pool<FakeFactory> {
        let factory = FakeFactory::default();
        factory.healthy.store(true, Ordering::SeqCst);
        Pool::new(
            factory,
            PoolBounds {
                min_size: min,
                max_size: max,
            },
            settings(acquire_ms),
        )
        .expect("pool")
    }

    #[test]
    fn prefills_min_size() {
        let pool = pool(2, 4, 50);
        let stats = pool.stats();
        assert_eq!(stats.open, 2);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.created, 2);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = pool(0, 2, 30);
        let a = pool.acquire(None).expect("first");
        let b = pool.acquire(None).expect("second");
        let err = pool.acquire(None).expect_err("pool is full");
        assert!(matches!(err, TrellisError::PoolExhausted { .. }));
        assert_eq!(pool.stats().acquire_timeouts, 1);

        drop(a);
        let c = pool.acquire(None).expect("slot returned");
        assert_eq!(pool.stats().leased, 2);
        drop((b, c));
        assert_eq!(pool.stats().idle, 2);
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let pool = Arc::new(pool(0, 1, 2_000));
        let held = pool.acquire(None).expect("held");
        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire(None).map(|lease| lease.id()))
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        let id = waiter.join().expect("join").expect("woken");
        assert_eq!(id, 2);
    }

    #[test]
    fn max_plus_one_concurrent_acquires_yield_one_exhaustion() {
        let max = 4;
        let pool = Arc::new(pool(0, max, 100));
        let barrier = Arc::new(Barrier::new(max + 1));
        let workers: Vec<_> = (0..=max)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let result = pool.acquire(None);
                    // hold well past the acquire timeout
                    std::thread::sleep(Duration::from_millis(400));
                    result.is_err()
                })
            })
            .collect();
        let failures = workers
            .into_iter()
            .map(|w| w.join().expect("join"))
            .filter(|failed| *failed)
            .count();
        assert_eq!(failures, 1);
        assert_eq!(pool.stats().acquire_timeouts, 1);
    }

    #[test]
    fn release_by_non_owner_is_refused() {
        let pool = pool(0, 1, 30);
        let owner = TxId::new_v4();
        let lease = pool.acquire(Some(owner)).expect("lease");

        let rejected = lease
            .release(Some(TxId::new_v4()))
            .expect_err("wrong owner");
        assert!(matches!(rejected.error, TrellisError::LeaseViolation { .. }));
        let lease = rejected.lease.expect("lease handed back");
        assert_eq!(pool.stats().leased, 1);

        lease.release(Some(owner)).expect("owner release");
        assert_eq!(pool.stats().leased, 0);
    }

    #[test]
    fn expired_lease_is_revoked_and_slot_reclaimed() {
        let factory = FakeFactory::default();
        factory.healthy.store(true, Ordering::SeqCst);
        let mut s = settings(30);
        s.lease_timeout = Duration::from_millis(10);
        let pool = Pool::new(
            factory,
            PoolBounds {
                min_size: 0,
                max_size: 1,
            },
            s,
        )
        .expect("pool");

        let mut lease = pool.acquire(None).expect("lease");
        std::thread::sleep(Duration::from_millis(30));
        pool.health_check();

        assert!(lease.connection().is_err());
        assert_eq!(pool.stats().revoked_leases, 1);
        // the revoked slot is available again
        let other = pool.acquire(None).expect("reclaimed slot");
        let err = lease.release(None).expect_err("revoked");
        assert!(err.lease.is_none());
        drop(other);
        assert_eq!(pool.stats().open, 1);
    }

    #[test]
    fn unhealthy_idle_connection_is_never_handed_out() {
        let pool = pool(1, 2, 50);
        pool.factory().healthy.store(false, Ordering::SeqCst);
        // the prefilled connection shares the flag and fails its probe;
        // a fresh one is opened instead
        let mut lease = pool.acquire(None).expect("lease");
        assert_eq!(pool.stats().evicted, 1);
        assert_eq!(lease.connection().expect("conn").serial, 1);
    }

    #[test]
    fn idle_surplus_is_closed_down_to_min() {
        let factory = FakeFactory::default();
        factory.healthy.store(true, Ordering::SeqCst);
        let mut s = settings(30);
        s.idle_timeout = Duration::from_millis(5);
        let pool = Pool::new(
            factory,
            PoolBounds {
                min_size: 1,
                max_size: 3,
            },
            s,
        )
        .expect("pool");
        let leases: Vec<_> = (0..3).map(|_| pool.acquire(None).expect("lease")).collect();
        drop(leases);
        assert_eq!(pool.stats().idle, 3);

        std::thread::sleep(Duration::from_millis(20));
        pool.health_check();
        let stats = pool.stats();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.idle_closed, 2);
    }

    #[test]
    fn shutdown_fails_later_acquires() {
        let pool = pool(1, 1, 30);
        pool.start_health_checks().expect("thread");
        pool.shutdown();
        assert!(pool.acquire(None).is_err());
    }
}
