// Configuration management with layered configuration (file, env)

use crate::errors::ConfigurationError;
use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Legacy variables set by the deployment scripts; they win over
/// every other layer.
const LEGACY_DATABASE_ENV: &[(&str, &str)] = &[
    ("DB_HOST", "database.host"),
    ("DB_PORT", "database.port"),
    ("DB_NAME", "database.name"),
    ("DB_USER", "database.user"),
    ("DB_PASSWORD", "database.password"),
    ("DB_MIN_CONNECTIONS", "database.min_connections"),
    ("DB_MAX_CONNECTIONS", "database.max_connections"),
];

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds a client should wait before retrying after a 503
    #[serde(default = "default_retry_after_seconds")]
    pub retry_after_seconds: u64,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub connect_timeout_seconds: u64,
    /// Default bound on `acquire`; `None` waits indefinitely
    #[serde(default)]
    pub acquire_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub idle_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub maintenance_interval_seconds: Option<u64>,
    /// Attempts made at startup when the database is unreachable
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

fn default_retry_after_seconds() -> u64 {
    5
}

fn default_startup_attempts() -> u32 {
    5
}

fn default_run_migrations() -> bool {
    true
}

// The password never reaches the logs.
impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_seconds", &self.connect_timeout_seconds)
            .field("acquire_timeout_seconds", &self.acquire_timeout_seconds)
            .field("idle_timeout_seconds", &self.idle_timeout_seconds)
            .field(
                "maintenance_interval_seconds",
                &self.maintenance_interval_seconds,
            )
            .field("startup_attempts", &self.startup_attempts)
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_seconds.map(Duration::from_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_seconds.map(Duration::from_secs)
    }

    pub fn maintenance_interval(&self) -> Option<Duration> {
        self.maintenance_interval_seconds.map(Duration::from_secs)
    }

    /// Reject values that would produce a pool that silently cannot connect
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.host.trim().is_empty() {
            return Err(ConfigurationError::Missing("database.host".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::Missing("database.name".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigurationError::Missing("database.user".to_string()));
        }
        if self.port == 0 {
            return Err(invalid("database.port", "must be greater than 0"));
        }
        if self.max_connections == 0 {
            return Err(invalid("database.max_connections", "must be greater than 0"));
        }
        if self.min_connections > self.max_connections {
            return Err(invalid(
                "database.min_connections",
                format!(
                    "{} exceeds max_connections {}",
                    self.min_connections, self.max_connections
                ),
            ));
        }
        if self.connect_timeout_seconds == 0 {
            return Err(invalid(
                "database.connect_timeout_seconds",
                "must be greater than 0",
            ));
        }
        if self.maintenance_interval_seconds == Some(0) {
            return Err(invalid(
                "database.maintenance_interval_seconds",
                "must be greater than 0 when set",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigurationError> {
        dotenvy::dotenv().ok();
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigurationError> {
        Self::load_with_env(config_dir, std::env::vars().collect())
    }

    /// Load configuration from `config_dir`, reading `APP__*` and the legacy
    /// `DB_*` variables from `env` instead of the process environment
    pub fn load_with_env<P: AsRef<Path>>(
        config_dir: P,
        env: Map<String, String>,
    ) -> Result<Self, ConfigurationError> {
        let config_dir = config_dir.as_ref();
        let legacy: Vec<_> = LEGACY_DATABASE_ENV
            .iter()
            .map(|(var, key)| (*key, env.get(*var).cloned()))
            .collect();

        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.port", 5432)?
            .set_default("database.min_connections", 1)?
            .set_default("database.max_connections", 5)?
            .set_default("database.connect_timeout_seconds", 10)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "json")?
            // Committed defaults
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(env)),
            );

        for (key, value) in legacy {
            builder = builder.set_override_option(key, value)?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.server.port == 0 {
            return Err(invalid("server.port", "must be greater than 0"));
        }
        self.database.validate()?;
        if self.observability.log_level.trim().is_empty() {
            return Err(ConfigurationError::Missing(
                "observability.log_level".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_database_config() -> DatabaseConfig {
    DatabaseConfig {
        host: "localhost".to_string(),
        port: 5432,
        name: "browseshield".to_string(),
        user: "browseshield".to_string(),
        password: "secret".to_string(),
        min_connections: 1,
        max_connections: 5,
        connect_timeout_seconds: 5,
        acquire_timeout_seconds: None,
        idle_timeout_seconds: None,
        maintenance_interval_seconds: None,
        startup_attempts: 1,
        run_migrations: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_valid_database_config() {
        assert!(test_database_config().validate().is_ok());
    }

    #[test]
    fn test_validation_catches_missing_host() {
        let mut config = test_database_config();
        config.host = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Missing(field)) if field == "database.host"
        ));
    }

    #[test]
    fn test_validation_catches_missing_database_name() {
        let mut config = test_database_config();
        config.name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_catches_min_above_max() {
        let mut config = test_database_config();
        config.min_connections = 6;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Invalid { field, .. }) if field == "database.min_connections"
        ));
    }

    #[test]
    fn test_validation_catches_zero_max_connections() {
        let mut config = test_database_config();
        config.min_connections = 0;
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", test_database_config());
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            r#"
[database]
host = "db.internal"
name = "metrics"
user = "shield"
password = "pw"
max_connections = 8
idle_timeout_seconds = 300
"#
        )
        .unwrap();

        let settings = Settings::load_with_env(dir.path(), Map::new()).unwrap();
        assert_eq!(settings.database.host, "db.internal");
        assert_eq!(settings.database.port, 5432);
        assert_eq!(settings.database.min_connections, 1);
        assert_eq!(settings.database.max_connections, 8);
        assert_eq!(
            settings.database.idle_timeout(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.observability.log_format, LogFormat::Json);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_env_layers_override_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[database]\nhost = \"db.internal\"\nname = \"metrics\"\nuser = \"shield\"\npassword = \"pw\"\nmax_connections = 8\n",
        )
        .unwrap();

        let env: Map<String, String> = [
            ("APP__DATABASE__HOST", "db.app"),
            ("APP__DATABASE__MAX_CONNECTIONS", "12"),
            ("APP__SERVER__PORT", "9090"),
            ("DB_HOST", "db.legacy"),
            ("HOME", "/root"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let settings = Settings::load_with_env(dir.path(), env).unwrap();
        assert_eq!(settings.database.host, "db.legacy");
        assert_eq!(settings.database.max_connections, 12);
        assert_eq!(settings.database.name, "metrics");
        assert_eq!(settings.server.port, 9090);
    }
}
