// Configuration management with layered configuration (file, env)

use crate::errors::ConfigurationError;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Target database identity; the password is resolved from the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_password_env_prefix")]
    pub password_env_prefix: String,
    /// Deadline for each SQL statement a session runs; absent means none
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
}

impl DatabaseConfig {
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }
}

fn default_db_port() -> u16 {
    5432
}

fn default_password_env_prefix() -> String {
    "PG_PASSWORD".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_recycle_after")]
    pub recycle_after_seconds: u64,
    /// Absent means unbounded: acquire never waits
    #[serde(default)]
    pub max_connections_per_dsn: Option<u32>,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
}

fn default_recycle_after() -> u64 {
    600
}

fn default_acquire_timeout() -> u64 {
    30
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            recycle_after_seconds: default_recycle_after(),
            max_connections_per_dsn: None,
            acquire_timeout_seconds: default_acquire_timeout(),
        }
    }
}

impl PoolSettings {
    pub fn recycle_after(&self) -> Duration {
        Duration::from_secs(self.recycle_after_seconds)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Deadline for each cache-store round trip
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,
}

fn default_batch_concurrency() -> usize {
    1
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            operation_timeout_ms: None,
            batch_concurrency: default_batch_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("QCACHE")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.database.name.is_empty() {
            return Err(ConfigurationError::MissingSetting("database.name".to_string()));
        }
        if self.database.user.is_empty() {
            return Err(ConfigurationError::MissingSetting("database.user".to_string()));
        }
        if self.database.host.is_empty() {
            return Err(ConfigurationError::MissingSetting("database.host".to_string()));
        }
        if self.database.port == 0 {
            return Err(invalid("database.port", "must be greater than 0"));
        }

        if self.pool.recycle_after_seconds == 0 {
            return Err(invalid("pool.recycle_after_seconds", "must be greater than 0"));
        }
        if self.pool.max_connections_per_dsn == Some(0) {
            return Err(invalid("pool.max_connections_per_dsn", "must be greater than 0"));
        }

        if self.redis.url.is_empty() {
            return Err(ConfigurationError::MissingSetting("redis.url".to_string()));
        }

        if self.database.statement_timeout_ms == Some(0) {
            return Err(invalid("database.statement_timeout_ms", "must be greater than 0"));
        }
        if self.cache.operation_timeout_ms == Some(0) {
            return Err(invalid("cache.operation_timeout_ms", "must be greater than 0"));
        }

        if self.cache.batch_concurrency == 0 {
            return Err(invalid("cache.batch_concurrency", "must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(name: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                name: "app".to_string(),
                user: "app".to_string(),
                host: "localhost".to_string(),
                port: default_db_port(),
                password_env_prefix: default_password_env_prefix(),
                statement_timeout_ms: None,
            },
            pool: PoolSettings::default(),
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
            },
            cache: CacheSettings::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
