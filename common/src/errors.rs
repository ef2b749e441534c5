// Error handling framework
// Configuration errors are fatal at startup, pool ordering errors are loud,
// connectivity errors are retryable and release never raises.

use std::time::Duration;
use thiserror::Error;

/// Connection pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// `acquire` was called before `initialize` (or after `shutdown`).
    /// This is an ordering bug in the caller and must not be retried.
    #[error("Connection pool is not initialized")]
    NotInitialized,

    #[error("Connection pool is closed")]
    Closed,

    #[error("Timed out after {0:?} waiting for a pooled connection")]
    AcquireTimeout(Duration),

    #[error("Failed to connect to the database: {0}")]
    Connect(String),

    #[error("Invalid pool options: {0}")]
    InvalidOptions(String),

    #[error("Connection pool accounting exhausted without an idle connection")]
    Saturated,
}

impl PoolError {
    /// Whether the caller may retry the operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Connect(_) | PoolError::AcquireTimeout(_))
    }

    /// Short label used for metrics and logs
    pub fn reason(&self) -> &'static str {
        match self {
            PoolError::NotInitialized => "not_initialized",
            PoolError::Closed => "closed",
            PoolError::AcquireTimeout(_) => "timeout",
            PoolError::Connect(_) => "connect",
            PoolError::InvalidOptions(_) => "invalid_options",
            PoolError::Saturated => "saturated",
        }
    }
}

/// Configuration errors, surfaced before the service starts accepting traffic
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Missing required configuration value: {0}")]
    Missing(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

impl DatabaseError {
    /// The store could not be reached; the connection in hand should be
    /// discarded and the client told to retry later.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, DatabaseError::Pool(pool_err) if pool_err.is_retryable())
    }
}

/// Validation errors for incoming scan requests
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },
}

/// API response error type for HTTP responses
#[derive(Debug, serde::Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        let code = if err.is_retryable() {
            "SERVICE_UNAVAILABLE"
        } else {
            "INTERNAL_ERROR"
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Pool(pool_err) => pool_err.into(),
            DatabaseError::Configuration(config_err) => {
                ApiError::new("CONFIGURATION_ERROR", config_err.to_string())
            }
            other => ApiError::new("DATABASE_ERROR", other.to_string()),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::new("VALIDATION_ERROR", err.to_string())
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.code().as_deref() == Some("23505") {
                    DatabaseError::DuplicateKey(db_err.message().to_string())
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
                DatabaseError::Pool(PoolError::Connect(err.to_string()))
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::MigrationFailed(err.to_string())
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(key) => ConfigurationError::Missing(key),
            other => ConfigurationError::Load(other.to_string()),
        }
    }
}
