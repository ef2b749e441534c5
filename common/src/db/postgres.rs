// PostgreSQL connections for the pool, built from the database settings

use super::manager::{Initialization, PoolManager};
use super::pool::{ConnectionFactory, PoolOptions};
use crate::config::DatabaseConfig;
use crate::errors::{DatabaseError, PoolError};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;
use tracing::{debug, instrument};

/// Pool manager over PostgreSQL connections
pub type PgPoolManager = PoolManager<PgConnectionFactory>;

/// Opens `PgConnection`s with a bounded connect time
#[derive(Debug, Clone)]
pub struct PgConnectionFactory {
    options: PgConnectOptions,
    connect_timeout: Duration,
}

impl PgConnectionFactory {
    /// Build a factory from validated settings
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        config.validate()?;

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.name)
            .username(&config.user)
            .password(&config.password)
            .application_name("browseshield-api");

        Ok(Self {
            options,
            connect_timeout: config.connect_timeout(),
        })
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, PoolError> {
        tokio::time::timeout(self.connect_timeout, self.options.connect())
            .await
            .map_err(|_| {
                PoolError::Connect(format!(
                    "no response within {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| PoolError::Connect(e.to_string()))
    }

    async fn ping(&self, conn: &mut PgConnection) -> Result<(), PoolError> {
        conn.ping()
            .await
            .map_err(|e| PoolError::Connect(e.to_string()))
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error while closing database connection");
        }
    }
}

impl From<&DatabaseConfig> for PoolOptions {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            min_connections: config.min_connections,
            max_connections: config.max_connections,
            acquire_timeout: config.acquire_timeout(),
            idle_timeout: config.idle_timeout(),
            maintenance_interval: config.maintenance_interval(),
            test_before_acquire: true,
        }
    }
}

impl PoolManager<PgConnectionFactory> {
    /// Validate the settings and initialize the pool against PostgreSQL.
    ///
    /// # Errors
    /// `DatabaseError::Configuration` for missing or invalid settings (never
    /// retried), `DatabaseError::Pool` when connections cannot be opened.
    #[instrument(skip(self, config), fields(host = %config.host, database = %config.name))]
    pub async fn initialize_postgres(
        &self,
        config: &DatabaseConfig,
    ) -> Result<Initialization, DatabaseError> {
        let factory = PgConnectionFactory::from_config(config)?;
        let initialization = self.initialize(PoolOptions::from(config), factory).await?;
        Ok(initialization)
    }
}

/// Apply pending schema migrations over a pooled connection
#[instrument(skip(manager))]
pub async fn run_migrations(manager: &PgPoolManager) -> Result<(), DatabaseError> {
    let mut conn = manager.acquire().await?;
    sqlx::migrate!("../migrations").run(&mut *conn).await?;
    debug!("Database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_database_config;
    use crate::errors::ConfigurationError;

    #[test]
    fn test_factory_rejects_missing_user() {
        let mut config = test_database_config();
        config.user = String::new();

        let result = PgConnectionFactory::from_config(&config);
        assert!(matches!(
            result,
            Err(DatabaseError::Configuration(ConfigurationError::Missing(_)))
        ));
    }

    #[test]
    fn test_pool_options_from_config() {
        let mut config = test_database_config();
        config.acquire_timeout_seconds = Some(3);
        config.maintenance_interval_seconds = Some(30);

        let options = PoolOptions::from(&config);
        assert_eq!(options.min_connections, 1);
        assert_eq!(options.max_connections, 5);
        assert_eq!(options.acquire_timeout, Some(Duration::from_secs(3)));
        assert_eq!(options.maintenance_interval, Some(Duration::from_secs(30)));
        assert_eq!(options.idle_timeout, None);
    }

    #[tokio::test]
    async fn test_unreachable_database_is_a_connect_error() {
        let mut config = test_database_config();
        config.host = "127.0.0.1".to_string();
        config.port = 1;
        config.connect_timeout_seconds = 2;

        let factory = PgConnectionFactory::from_config(&config).unwrap();
        assert!(matches!(factory.connect().await, Err(PoolError::Connect(_))));
    }

    #[tokio::test]
    async fn test_lazy_pool_initializes_without_database() {
        let mut config = test_database_config();
        config.min_connections = 0;
        config.port = 1;
        config.host = "127.0.0.1".to_string();

        let manager = PgPoolManager::new();
        let outcome = manager.initialize_postgres(&config).await.unwrap();
        assert!(matches!(outcome, Initialization::Created { .. }));

        let err = manager.acquire().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(manager.status().unwrap().live, 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL instance
    async fn test_pool_against_live_database() {
        let manager = PgPoolManager::new();
        manager
            .initialize_postgres(&test_database_config())
            .await
            .unwrap();
        assert!(manager.health_check().await.is_ok());
        manager.shutdown().await;
    }
}
