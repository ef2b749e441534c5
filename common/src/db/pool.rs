// Bounded connection pool engine
//
// Accounting: the semaphore holds one permit per connection that may be
// checked out; `live` counts idle plus checked-out connections and is only
// changed under the state mutex. A caller holding a permit that finds the
// idle queue empty is guaranteed `live < max`, so creation never overshoots.

use crate::errors::PoolError;
use crate::telemetry;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Creates, checks and disposes of the connections a pool hands out
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection to the backing store
    async fn connect(&self) -> Result<Self::Connection, PoolError>;

    /// Round-trip to the backing store
    async fn ping(&self, conn: &mut Self::Connection) -> Result<(), PoolError>;

    /// Cheap check run on release; broken connections are disposed instead
    /// of being returned to the idle set. Must not block.
    fn is_broken(&self, _conn: &Self::Connection) -> bool {
        false
    }

    /// Close a connection the pool no longer needs
    async fn close(&self, conn: Self::Connection);
}

/// Pool sizing and timing options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub min_connections: u32,
    pub max_connections: u32,
    /// Default bound applied by [`ConnectionPool::acquire`]
    pub acquire_timeout: Option<Duration>,
    /// Idle connections older than this are closed by maintenance, never
    /// below `min_connections`
    pub idle_timeout: Option<Duration>,
    pub maintenance_interval: Option<Duration>,
    /// Ping idle connections before handing them out; failures are closed
    /// and the acquire moves on to the next idle or a new connection
    pub test_before_acquire: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 5,
            acquire_timeout: None,
            idle_timeout: None,
            maintenance_interval: None,
            test_before_acquire: true,
        }
    }
}

impl PoolOptions {
    pub fn new(min_connections: u32, max_connections: u32) -> Self {
        Self {
            min_connections,
            max_connections,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidOptions(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidOptions(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.maintenance_interval == Some(Duration::ZERO) {
            return Err(PoolError::InvalidOptions(
                "maintenance_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub generation: u64,
    pub min_connections: u32,
    pub max_connections: u32,
    /// Idle plus checked-out connections
    pub live: u32,
    pub idle: u32,
    pub checked_out: u32,
    pub closed: bool,
    pub created_total: u64,
    pub destroyed_total: u64,
    pub acquired_total: u64,
}

struct IdleConnection<C> {
    conn: C,
    id: u64,
    idle_since: Instant,
}

struct PoolState<C> {
    /// Most recently returned at the back
    idle: VecDeque<IdleConnection<C>>,
    live: u32,
    checked_out: u32,
    closed: bool,
    next_id: u64,
    created: u64,
    destroyed: u64,
    acquired: u64,
}

impl<C> PoolState<C> {
    fn issue_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.created += 1;
        id
    }
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    options: PoolOptions,
    generation: u64,
    state: Mutex<PoolState<F::Connection>>,
    semaphore: Semaphore,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// A creation slot counted in `live` before the connection exists. Dropping
/// it armed (connect failed or the caller was cancelled) gives the slot back.
struct SlotReservation<'a, F: ConnectionFactory> {
    inner: &'a PoolInner<F>,
    armed: bool,
}

impl<F: ConnectionFactory> SlotReservation<'_, F> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: ConnectionFactory> Drop for SlotReservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.lock_state();
            state.live = state.live.saturating_sub(1);
        }
    }
}

/// An idle connection taken off the queue but not yet handed out. It still
/// counts in `live`; dropping it unclaimed (pool closed, caller cancelled)
/// gives that count back.
struct IdleCheckout<'a, F: ConnectionFactory> {
    inner: &'a PoolInner<F>,
    entry: Option<IdleConnection<F::Connection>>,
}

impl<F: ConnectionFactory> IdleCheckout<'_, F> {
    fn conn_mut(&mut self) -> Option<&mut F::Connection> {
        self.entry.as_mut().map(|entry| &mut entry.conn)
    }
}

impl<F: ConnectionFactory> Drop for IdleCheckout<'_, F> {
    fn drop(&mut self) {
        if self.entry.take().is_some() {
            let mut state = self.inner.lock_state();
            state.live = state.live.saturating_sub(1);
            state.destroyed += 1;
        }
    }
}

enum Checkout<'a, F: ConnectionFactory> {
    Idle(IdleCheckout<'a, F>),
    Create(SlotReservation<'a, F>),
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, state: &PoolState<F::Connection>) -> PoolStatus {
        PoolStatus {
            generation: self.generation,
            min_connections: self.options.min_connections,
            max_connections: self.options.max_connections,
            live: state.live,
            idle: state.idle.len() as u32,
            checked_out: state.checked_out,
            closed: state.closed,
            created_total: state.created,
            destroyed_total: state.destroyed,
            acquired_total: state.acquired,
        }
    }

    /// Must be called while holding a semaphore permit
    fn checkout(&self) -> Result<Checkout<'_, F>, PoolError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(PoolError::Closed);
        }
        if let Some(idle) = state.idle.pop_back() {
            return Ok(Checkout::Idle(IdleCheckout {
                inner: self,
                entry: Some(idle),
            }));
        }
        if state.live >= self.options.max_connections {
            return Err(PoolError::Saturated);
        }
        state.live += 1;
        Ok(Checkout::Create(SlotReservation {
            inner: self,
            armed: true,
        }))
    }

    /// Hand out a validated idle connection
    fn commit_idle(
        &self,
        mut checkout: IdleCheckout<'_, F>,
    ) -> Result<(F::Connection, u64), PoolError> {
        let mut state = self.lock_state();
        if state.closed {
            drop(state);
            return Err(PoolError::Closed);
        }
        match checkout.entry.take() {
            Some(entry) => {
                state.checked_out += 1;
                state.acquired += 1;
                Ok((entry.conn, entry.id))
            }
            None => Err(PoolError::Saturated),
        }
    }

    /// Account for an idle connection that failed validation and return it
    /// for closing
    fn reject_idle(
        &self,
        mut checkout: IdleCheckout<'_, F>,
    ) -> Option<IdleConnection<F::Connection>> {
        let entry = checkout.entry.take()?;
        let mut state = self.lock_state();
        state.live = state.live.saturating_sub(1);
        state.destroyed += 1;
        Some(entry)
    }

    /// Turn a reserved slot into a checked-out connection id
    fn commit_checkout(&self, slot: SlotReservation<'_, F>) -> Result<u64, PoolError> {
        let id = {
            let mut state = self.lock_state();
            if state.closed {
                None
            } else {
                state.checked_out += 1;
                state.acquired += 1;
                Some(state.issue_id())
            }
        };
        match id {
            Some(id) => {
                slot.disarm();
                Ok(id)
            }
            None => Err(PoolError::Closed),
        }
    }

    /// Open one connection straight into the idle set using spare capacity.
    /// Returns `Ok(false)` when there is no spare capacity or the pool closed.
    async fn add_idle_connection(&self) -> Result<bool, PoolError> {
        let Ok(_permit) = self.semaphore.try_acquire() else {
            return Ok(false);
        };
        let slot = {
            let mut state = self.lock_state();
            if state.closed || state.live >= self.options.max_connections {
                return Ok(false);
            }
            state.live += 1;
            SlotReservation {
                inner: self,
                armed: true,
            }
        };

        let conn = self.factory.connect().await?;

        let rejected = {
            let mut state = self.lock_state();
            if state.closed {
                Some(conn)
            } else {
                let id = state.issue_id();
                state.idle.push_back(IdleConnection {
                    conn,
                    id,
                    idle_since: Instant::now(),
                });
                None
            }
        };
        match rejected {
            Some(conn) => {
                drop(slot);
                self.factory.close(conn).await;
                Ok(false)
            }
            None => {
                slot.disarm();
                Ok(true)
            }
        }
    }

    /// Return a connection to the idle set, or dispose of it when the pool
    /// has closed or the connection is broken. Never blocks on capacity.
    fn put_back(self: &Arc<Self>, id: u64, conn: F::Connection, discard: bool) {
        let broken = discard || self.factory.is_broken(&conn);
        let (discarded, status) = {
            let mut state = self.lock_state();
            state.checked_out = state.checked_out.saturating_sub(1);
            let discarded = if state.closed || broken {
                state.live = state.live.saturating_sub(1);
                state.destroyed += 1;
                Some(conn)
            } else {
                state.idle.push_back(IdleConnection {
                    conn,
                    id,
                    idle_since: Instant::now(),
                });
                None
            };
            (discarded, self.snapshot(&state))
        };
        self.semaphore.add_permits(1);
        telemetry::record_pool_status(&status);

        if let Some(conn) = discarded {
            if broken {
                warn!(
                    generation = self.generation,
                    connection_id = id,
                    "Discarding broken connection on release"
                );
            } else {
                debug!(
                    generation = self.generation,
                    connection_id = id,
                    "Pool closed; disposing released connection"
                );
            }
            self.dispose(conn);
        }
    }

    fn dispose(self: &Arc<Self>, conn: F::Connection) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    inner.factory.close(conn).await;
                });
            }
            // Outside a runtime the connection is simply dropped
            Err(_) => drop(conn),
        }
    }
}

/// Bounded pool of connections produced by a [`ConnectionFactory`]
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .finish()
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a pool and eagerly open `min_connections` connections.
    ///
    /// If a maintenance interval is configured, a background task runs
    /// [`maintain`](Self::maintain) until the pool is closed or dropped.
    ///
    /// # Errors
    /// `InvalidOptions` for bad sizing, or the factory's error if an eager
    /// connection cannot be opened (connections already opened are closed).
    #[instrument(skip(factory, options), fields(
        min_connections = options.min_connections,
        max_connections = options.max_connections
    ))]
    pub async fn open(factory: F, options: PoolOptions, generation: u64) -> Result<Self, PoolError> {
        options.validate()?;

        let max = options.max_connections as usize;
        let pool = Self {
            inner: Arc::new(PoolInner {
                factory,
                generation,
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(max),
                    live: 0,
                    checked_out: 0,
                    closed: false,
                    next_id: 1,
                    created: 0,
                    destroyed: 0,
                    acquired: 0,
                }),
                semaphore: Semaphore::new(max),
                maintenance: Mutex::new(None),
                options,
            }),
        };

        for _ in 0..pool.inner.options.min_connections {
            if let Err(e) = pool.inner.add_idle_connection().await {
                warn!(error = %e, "Failed to open minimum connections");
                pool.close().await;
                return Err(e);
            }
        }

        if let Some(interval) = pool.inner.options.maintenance_interval {
            pool.spawn_maintenance(interval);
        }

        let status = pool.status();
        telemetry::record_pool_status(&status);
        info!(
            generation,
            live = status.live,
            "Connection pool opened"
        );
        Ok(pool)
    }

    fn spawn_maintenance(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = ConnectionPool { inner };
                if pool.is_closed() {
                    break;
                }
                pool.maintain().await;
            }
        });
        *self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock_state();
        self.inner.snapshot(&state)
    }

    /// Whether `conn` was handed out by this pool instance
    pub fn owns(&self, conn: &PooledConnection<F>) -> bool {
        Arc::ptr_eq(&self.inner, &conn.pool)
    }

    /// Check out a connection, applying the configured default timeout.
    ///
    /// Without a default timeout this waits as long as the pool is
    /// saturated. Dropping the returned future abandons the wait.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        match self.inner.options.acquire_timeout {
            Some(timeout) => self.acquire_with_timeout(timeout).await,
            None => self.acquire_inner().await,
        }
    }

    /// Check out a connection, failing with `AcquireTimeout` after `timeout`
    pub async fn acquire_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<F>, PoolError> {
        tokio::time::timeout(timeout, self.acquire_inner())
            .await
            .map_err(|_| PoolError::AcquireTimeout(timeout))?
    }

    async fn acquire_inner(&self) -> Result<PooledConnection<F>, PoolError> {
        let inner = &self.inner;

        // A closed semaphore means the pool was shut down
        let permit = inner
            .semaphore
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;

        let (conn, id) = loop {
            match inner.checkout()? {
                Checkout::Idle(mut idle) => {
                    let healthy = match idle.conn_mut() {
                        Some(conn) if inner.options.test_before_acquire => {
                            inner.factory.ping(conn).await
                        }
                        _ => Ok(()),
                    };
                    match healthy {
                        Ok(()) => break inner.commit_idle(idle)?,
                        Err(e) => {
                            if let Some(entry) = inner.reject_idle(idle) {
                                warn!(
                                    generation = inner.generation,
                                    connection_id = entry.id,
                                    error = %e,
                                    "Idle connection failed validation; closing"
                                );
                                inner.factory.close(entry.conn).await;
                            }
                            telemetry::record_pool_status(&self.status());
                        }
                    }
                }
                Checkout::Create(slot) => {
                    let conn = inner.factory.connect().await.map_err(|e| {
                        warn!(
                            generation = inner.generation,
                            error = %e,
                            "Failed to open pooled connection"
                        );
                        e
                    })?;
                    match inner.commit_checkout(slot) {
                        Ok(id) => {
                            debug!(
                                generation = inner.generation,
                                connection_id = id,
                                "Opened new pooled connection"
                            );
                            break (conn, id);
                        }
                        Err(e) => {
                            inner.factory.close(conn).await;
                            return Err(e);
                        }
                    }
                }
            }
        };

        // Given back by `put_back`
        permit.forget();

        telemetry::record_pool_status(&self.status());
        Ok(PooledConnection {
            conn: Some(conn),
            id,
            discard: false,
            pool: Arc::clone(inner),
        })
    }

    /// Return a connection. Never fails: a connection from another pool
    /// goes back to its own pool, which disposes of it if closed.
    pub fn release(&self, conn: PooledConnection<F>) {
        if !self.owns(&conn) {
            warn!(
                generation = self.inner.generation,
                connection_generation = conn.generation(),
                connection_id = conn.id(),
                "Released connection does not belong to this pool"
            );
        }
        drop(conn);
    }

    /// Acquire a connection and round-trip to the backing store
    pub async fn ping(&self) -> Result<(), PoolError> {
        let mut conn = self.acquire().await?;
        let result = self.inner.factory.ping(&mut conn).await;
        if result.is_err() {
            conn.discard();
        }
        result
    }

    /// Evict idle connections past `idle_timeout` while more than
    /// `min_connections` are live, then top `live` back up to the minimum.
    #[instrument(skip(self), fields(generation = self.inner.generation))]
    pub async fn maintain(&self) {
        let inner = &self.inner;
        let min = inner.options.min_connections;

        let expired: Vec<IdleConnection<F::Connection>> = match inner.options.idle_timeout {
            Some(idle_timeout) => {
                let mut state = inner.lock_state();
                let mut expired = Vec::new();
                while state.live > min {
                    let stale = state
                        .idle
                        .front()
                        .is_some_and(|entry| entry.idle_since.elapsed() >= idle_timeout);
                    if !stale {
                        break;
                    }
                    if let Some(entry) = state.idle.pop_front() {
                        state.live -= 1;
                        state.destroyed += 1;
                        expired.push(entry);
                    }
                }
                expired
            }
            None => Vec::new(),
        };

        let evicted = expired.len();
        for entry in expired {
            debug!(connection_id = entry.id, "Closing idle connection");
            inner.factory.close(entry.conn).await;
        }

        let mut opened = 0;
        loop {
            let below_min = {
                let state = inner.lock_state();
                !state.closed && state.live < min
            };
            if !below_min {
                break;
            }
            match inner.add_idle_connection().await {
                Ok(true) => opened += 1,
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to replenish idle connections");
                    break;
                }
            }
        }

        let status = self.status();
        telemetry::record_pool_status(&status);
        if evicted > 0 || opened > 0 {
            info!(evicted, opened, live = status.live, "Pool maintenance completed");
        }
    }

    /// Close the pool: idle connections are closed now, checked-out ones
    /// when they are released, and every pending or later acquire fails
    /// with `Closed`. Calling it again has no effect.
    #[instrument(skip(self), fields(generation = self.inner.generation))]
    pub async fn close(&self) {
        let (drained, checked_out) = {
            let mut state = self.inner.lock_state();
            if state.closed {
                debug!("Connection pool already closed");
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(drained.len() as u32);
            state.destroyed += drained.len() as u64;
            (drained, state.checked_out)
        };

        self.inner.semaphore.close();

        let task = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        let closed = drained.len();
        for entry in drained {
            self.inner.factory.close(entry.conn).await;
        }

        telemetry::record_pool_status(&self.status());
        info!(
            closed,
            checked_out, "Connection pool closed; checked-out connections will be disposed on release"
        );
    }
}

/// A checked-out connection. Dereferences to the underlying connection and
/// goes back to its pool when dropped, on every exit path.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    id: u64,
    discard: bool,
    pool: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Generation of the pool this connection came from
    pub fn generation(&self) -> u64 {
        self.pool.generation
    }

    /// Dispose of the connection instead of returning it to the idle set.
    /// Use after an I/O failure left it in an unknown state.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("generation", &self.pool.generation)
            .finish()
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection is present until the handle is dropped")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("connection is present until the handle is dropped")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(self.id, conn, self.discard);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Debug)]
    pub struct TestConnection {
        pub serial: u32,
        pub broken: bool,
        pub epoch: u32,
    }

    /// In-memory factory that counts what the pool does with it
    #[derive(Debug, Default)]
    pub struct TestFactory {
        pub opened: AtomicU32,
        pub closed: AtomicU32,
        pub unreachable: AtomicBool,
        pub connect_delay_ms: AtomicU32,
        pub epoch: AtomicU32,
    }

    impl TestFactory {
        pub fn shared() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn opened(&self) -> u32 {
            self.opened.load(Ordering::SeqCst)
        }

        pub fn closed(&self) -> u32 {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::SeqCst);
        }

        /// Simulate a server restart: connections opened before it stop
        /// answering pings but still look healthy locally
        pub fn restart(&self) {
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ConnectionFactory for Arc<TestFactory> {
        type Connection = TestConnection;

        async fn connect(&self) -> Result<TestConnection, PoolError> {
            let delay = self.connect_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(PoolError::Connect("connection refused".to_string()));
            }
            let serial = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TestConnection {
                serial,
                broken: false,
                epoch: self.epoch.load(Ordering::SeqCst),
            })
        }

        async fn ping(&self, conn: &mut TestConnection) -> Result<(), PoolError> {
            if conn.broken
                || conn.epoch < self.epoch.load(Ordering::SeqCst)
                || self.unreachable.load(Ordering::SeqCst)
            {
                return Err(PoolError::Connect("ping failed".to_string()));
            }
            Ok(())
        }

        fn is_broken(&self, conn: &TestConnection) -> bool {
            conn.broken
        }

        async fn close(&self, _conn: TestConnection) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
