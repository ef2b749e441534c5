// Process-wide pool lifecycle: initialize once, hand out connections,
// shut down once. Constructed explicitly and injected, never a static.

use super::pool::{ConnectionFactory, ConnectionPool, PoolOptions, PoolStatus, PooledConnection};
use crate::errors::PoolError;
use crate::telemetry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Result of [`PoolManager::initialize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initialization {
    /// A new pool was created with this generation
    Created { generation: u64 },
    /// A pool already existed; nothing changed
    AlreadyInitialized { generation: u64 },
}

/// Owner of the single live connection pool.
///
/// `initialize` and `shutdown` are serialized; `acquire` and `release` may
/// run concurrently from any task.
pub struct PoolManager<F: ConnectionFactory> {
    current: RwLock<Option<ConnectionPool<F>>>,
    lifecycle: Mutex<()>,
    generations: AtomicU64,
}

impl<F: ConnectionFactory> Default for PoolManager<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PoolManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("status", &self.status())
            .finish()
    }
}

impl<F: ConnectionFactory> PoolManager<F> {
    /// Create an uninitialized manager
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            lifecycle: Mutex::new(()),
            generations: AtomicU64::new(0),
        }
    }

    fn current(&self) -> Option<ConnectionPool<F>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.current().is_some()
    }

    /// Status of the current pool, if any
    pub fn status(&self) -> Option<PoolStatus> {
        self.current().map(|pool| pool.status())
    }

    /// Create the pool unless one already exists.
    ///
    /// Later calls while a pool exists are no-ops and leave its options and
    /// identity untouched. On error the manager stays uninitialized.
    #[instrument(skip(self, options, factory), fields(
        min_connections = options.min_connections,
        max_connections = options.max_connections
    ))]
    pub async fn initialize(
        &self,
        options: PoolOptions,
        factory: F,
    ) -> Result<Initialization, PoolError> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(existing) = self.current() {
            debug!(
                generation = existing.generation(),
                "Connection pool already initialized; ignoring"
            );
            return Ok(Initialization::AlreadyInitialized {
                generation: existing.generation(),
            });
        }

        options.validate()?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let pool = ConnectionPool::open(factory, options, generation).await?;

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        info!(generation, "Connection pool initialized");
        Ok(Initialization::Created { generation })
    }

    /// Check out a connection.
    ///
    /// Fails immediately with `NotInitialized` before `initialize` or after
    /// `shutdown`. Waits while the pool is saturated, bounded only by the
    /// configured default acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PoolError> {
        let pool = self.pool_or_fail()?;
        pool.acquire().await.map_err(record_acquire_failure)
    }

    /// Check out a connection, giving up after `timeout`
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<F>, PoolError> {
        let pool = self.pool_or_fail()?;
        pool.acquire_with_timeout(timeout)
            .await
            .map_err(record_acquire_failure)
    }

    fn pool_or_fail(&self) -> Result<ConnectionPool<F>, PoolError> {
        self.current().ok_or_else(|| {
            error!("Connection requested before the pool was initialized");
            record_acquire_failure(PoolError::NotInitialized)
        })
    }

    /// Return a connection to its pool.
    ///
    /// Never fails and never waits, so it is safe in cleanup paths. A
    /// connection whose pool has been shut down, or that belongs to an
    /// earlier generation, is logged and disposed of. Dropping the handle
    /// has the same effect.
    pub fn release(&self, conn: PooledConnection<F>) {
        match self.current() {
            Some(pool) => pool.release(conn),
            None => {
                warn!(
                    connection_generation = conn.generation(),
                    connection_id = conn.id(),
                    "Connection released after pool shutdown; discarding"
                );
                drop(conn);
            }
        }
    }

    /// Acquire a connection and round-trip to the backing store
    pub async fn health_check(&self) -> Result<(), PoolError> {
        let pool = self.pool_or_fail()?;
        pool.ping().await
    }

    /// Close every connection and return to the uninitialized state.
    ///
    /// Pending acquires on the old pool fail with `Closed`; connections still
    /// checked out are disposed of when released. A second call is a no-op.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let pool = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match pool {
            Some(pool) => {
                let generation = pool.generation();
                pool.close().await;
                info!(generation, "Connection pool shut down");
            }
            None => debug!("Connection pool not initialized; shutdown is a no-op"),
        }
    }
}

fn record_acquire_failure(err: PoolError) -> PoolError {
    telemetry::record_acquire_failure(err.reason());
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::testing::TestFactory;
    use std::sync::Arc;

    type TestManager = PoolManager<Arc<TestFactory>>;

    #[tokio::test]
    async fn test_acquire_before_initialize_fails_fast() {
        let manager = TestManager::new();

        let result =
            tokio::time::timeout(Duration::from_millis(100), manager.acquire()).await;
        let err = result.expect("must not block").unwrap_err();
        assert_eq!(err, PoolError::NotInitialized);
        assert!(!manager.is_initialized());
        assert!(manager.status().is_none());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let manager = TestManager::new();
        let first = TestFactory::shared();
        let second = TestFactory::shared();

        let outcome = manager
            .initialize(PoolOptions::new(1, 2), Arc::clone(&first))
            .await
            .unwrap();
        assert_eq!(outcome, Initialization::Created { generation: 1 });

        let outcome = manager
            .initialize(PoolOptions::new(3, 9), Arc::clone(&second))
            .await
            .unwrap();
        assert_eq!(outcome, Initialization::AlreadyInitialized { generation: 1 });

        let status = manager.status().unwrap();
        assert_eq!(status.max_connections, 2);
        assert_eq!(status.min_connections, 1);
        assert_eq!(second.opened(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_initialize_creates_one_pool() {
        let manager = Arc::new(TestManager::new());
        let factory = TestFactory::shared();

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let factory = Arc::clone(&factory);
                tokio::spawn(async move {
                    manager.initialize(PoolOptions::new(1, 2), factory).await
                })
            })
            .collect();

        let mut created = 0;
        for call in calls {
            if let Initialization::Created { .. } = call.await.unwrap().unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(factory.opened(), 1);
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_manager_uninitialized() {
        let manager = TestManager::new();
        let factory = TestFactory::shared();
        factory.set_unreachable(true);

        let result = manager
            .initialize(PoolOptions::new(1, 2), Arc::clone(&factory))
            .await;
        assert!(matches!(result, Err(PoolError::Connect(_))));
        assert!(!manager.is_initialized());

        factory.set_unreachable(false);
        assert!(manager
            .initialize(PoolOptions::new(1, 2), Arc::clone(&factory))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let manager = TestManager::new();
        let result = manager
            .initialize(PoolOptions::new(4, 2), TestFactory::shared())
            .await;
        assert!(matches!(result, Err(PoolError::InvalidOptions(_))));
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_two_acquires_succeed_third_waits() {
        let manager = Arc::new(TestManager::new());
        manager
            .initialize(PoolOptions::new(1, 2), TestFactory::shared())
            .await
            .unwrap();

        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();

        let third = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire().await.map(|conn| conn.id()) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!third.is_finished());

        let released_id = first.id();
        manager.release(first);

        let id = tokio::time::timeout(Duration::from_secs(1), third)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(id, released_id);
        drop(second);
    }

    #[tokio::test]
    async fn test_acquire_timeout_when_saturated() {
        let manager = TestManager::new();
        manager
            .initialize(PoolOptions::new(0, 1), TestFactory::shared())
            .await
            .unwrap();

        let _held = manager.acquire().await.unwrap();
        let result = manager.acquire_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(PoolError::AcquireTimeout(_))));
    }

    #[tokio::test]
    async fn test_shutdown_then_acquire_fails_until_reinitialized() {
        let manager = TestManager::new();
        let factory = TestFactory::shared();
        manager
            .initialize(PoolOptions::new(2, 2), Arc::clone(&factory))
            .await
            .unwrap();

        manager.shutdown().await;
        assert_eq!(factory.closed(), 2);
        assert_eq!(
            manager.acquire().await.unwrap_err(),
            PoolError::NotInitialized
        );

        let outcome = manager
            .initialize(PoolOptions::new(1, 2), Arc::clone(&factory))
            .await
            .unwrap();
        assert_eq!(outcome, Initialization::Created { generation: 2 });
        assert!(manager.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_twice_is_noop() {
        let manager = TestManager::new();
        let factory = TestFactory::shared();
        manager
            .initialize(PoolOptions::new(1, 1), Arc::clone(&factory))
            .await
            .unwrap();

        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(factory.closed(), 1);
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_shutdown_on_uninitialized_manager() {
        let manager = TestManager::new();
        manager.shutdown().await;
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_release_after_shutdown_is_discarded() {
        let manager = TestManager::new();
        let factory = TestFactory::shared();
        manager
            .initialize(PoolOptions::new(1, 1), Arc::clone(&factory))
            .await
            .unwrap();

        let conn = manager.acquire().await.unwrap();
        manager.shutdown().await;
        manager.release(conn);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(factory.closed(), 1);
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_stale_generation_release_does_not_corrupt_new_pool() {
        let manager = TestManager::new();
        let old_factory = TestFactory::shared();
        manager
            .initialize(PoolOptions::new(0, 1), Arc::clone(&old_factory))
            .await
            .unwrap();
        let stale = manager.acquire().await.unwrap();
        manager.shutdown().await;

        let new_factory = TestFactory::shared();
        manager
            .initialize(PoolOptions::new(0, 1), Arc::clone(&new_factory))
            .await
            .unwrap();
        manager.release(stale);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = manager.status().unwrap();
        assert_eq!(status.generation, 2);
        assert_eq!(status.idle, 0);
        assert_eq!(old_factory.closed(), 1);

        let conn = manager.acquire().await.unwrap();
        assert_eq!(conn.generation(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_acquire() {
        let manager = Arc::new(TestManager::new());
        manager
            .initialize(PoolOptions::new(1, 1), TestFactory::shared())
            .await
            .unwrap();
        let held = manager.acquire().await.unwrap();

        let pending = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.shutdown().await;
        assert_eq!(pending.await.unwrap().unwrap_err(), PoolError::Closed);
        drop(held);
    }

    #[tokio::test]
    async fn test_health_check() {
        let manager = TestManager::new();
        assert_eq!(
            manager.health_check().await.unwrap_err(),
            PoolError::NotInitialized
        );

        let factory = TestFactory::shared();
        manager
            .initialize(PoolOptions::new(1, 1), Arc::clone(&factory))
            .await
            .unwrap();
        assert!(manager.health_check().await.is_ok());
    }
}
