// Bootstrap utilities for binary initialization
// Settings, logging and the connection pool, in the order the server needs them.

use crate::config::Settings;
use crate::db::{run_migrations, Initialization, PgPoolManager};
use crate::errors::DatabaseError;
use crate::retry::{retry_with, ExponentialBackoff, RetryStrategy};
use crate::telemetry;
use anyhow::{Context, Result};
use tracing::info;

/// Load and validate settings, then initialize logging from them.
///
/// # Errors
/// Returns error on missing or invalid configuration. Callers treat this as fatal.
pub fn init_settings_and_logging() -> Result<Settings> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings.validate().context("Invalid configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.log_format,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    Ok(settings)
}

/// Initialize the connection pool, retrying while the database is unreachable.
///
/// Configuration errors and ordering errors are returned on the first attempt.
/// Migrations run once the pool is up when `database.run_migrations` is set.
///
/// # Errors
/// Returns the last connectivity error once `database.startup_attempts` are spent.
#[tracing::instrument(skip(settings, manager))]
pub async fn init_pool_manager(
    settings: &Settings,
    manager: &PgPoolManager,
) -> Result<Initialization, DatabaseError> {
    let strategy = ExponentialBackoff::new().with_max_attempts(settings.database.startup_attempts);
    init_pool_manager_with(settings, manager, &strategy).await
}

/// [`init_pool_manager`] with an explicit backoff strategy
pub async fn init_pool_manager_with<S: RetryStrategy + ?Sized>(
    settings: &Settings,
    manager: &PgPoolManager,
    strategy: &S,
) -> Result<Initialization, DatabaseError> {
    info!(
        host = %settings.database.host,
        database = %settings.database.name,
        max_attempts = strategy.max_attempts(),
        "Initializing database pool"
    );

    let initialization = retry_with(strategy, is_transient, |_| {
        manager.initialize_postgres(&settings.database)
    })
    .await?;

    if settings.database.run_migrations {
        retry_with(strategy, is_transient, |_| run_migrations(manager)).await?;
        info!("Database migrations applied");
    }

    info!(?initialization, "Database pool ready");
    Ok(initialization)
}

fn is_transient(err: &DatabaseError) -> bool {
    err.is_unavailable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        test_database_config, LogFormat, ObservabilityConfig, ServerConfig,
    };
    use crate::errors::{ConfigurationError, PoolError};
    use crate::retry::FixedDelay;
    use std::time::Duration;

    fn test_settings() -> Settings {
        Settings {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                retry_after_seconds: 5,
            },
            database: test_database_config(),
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
                tracing_endpoint: None,
            },
        }
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&DatabaseError::Pool(PoolError::Connect(
            "refused".to_string()
        ))));
        assert!(!is_transient(&DatabaseError::Pool(PoolError::NotInitialized)));
        assert!(!is_transient(&DatabaseError::Configuration(
            ConfigurationError::Missing("database.user".to_string())
        )));
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_not_retried() {
        let mut settings = test_settings();
        settings.database.name = String::new();
        let manager = PgPoolManager::new();
        let strategy = FixedDelay::new(Duration::from_secs(60), 10);

        // A retry would sleep for a minute; the timeout proves there was none
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            init_pool_manager_with(&settings, &manager, &strategy),
        )
        .await
        .expect("configuration errors must fail fast");

        assert!(matches!(result, Err(DatabaseError::Configuration(_))));
        assert!(!manager.is_initialized());
    }

    #[tokio::test]
    async fn test_unreachable_database_exhausts_attempts() {
        let mut settings = test_settings();
        settings.database.host = "127.0.0.1".to_string();
        settings.database.port = 1;
        settings.database.connect_timeout_seconds = 1;
        let manager = PgPoolManager::new();
        let strategy = FixedDelay::new(Duration::from_millis(10), 2);

        let result = init_pool_manager_with(&settings, &manager, &strategy).await;

        assert!(matches!(
            result,
            Err(DatabaseError::Pool(PoolError::Connect(_)))
        ));
        assert!(!manager.is_initialized());
    }
}
