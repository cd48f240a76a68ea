// Configuration management with layered configuration (file, env)

use crate::errors::DatabaseError;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Connection pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(alias = "name")]
    pub database: String,
    #[serde(default = "default_max_connections", alias = "connection_limit")]
    pub max_connections: usize,
    /// Maximum number of callers waiting for a connection; 0 means unlimited
    #[serde(default)]
    pub queue_limit: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

fn default_port() -> u16 {
    3306
}

fn default_max_connections() -> usize {
    10
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_keep_alive() -> bool {
    true
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

impl DatabaseConfig {
    /// Build a configuration with default pool tuning for the given endpoint
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            password: password.into(),
            database: database.into(),
            max_connections: default_max_connections(),
            queue_limit: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            keep_alive: default_keep_alive(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }

    /// Load the flat storefront variables (`DB_HOST`, `DB_USER`, `DB_PASSWORD`,
    /// `DB_NAME`, `DB_CONNECTION_LIMIT`, `DB_QUEUE_LIMIT`, ...)
    pub fn from_env() -> Result<Self, DatabaseError> {
        let config = Config::builder()
            .add_source(Environment::with_prefix("DB").try_parsing(true))
            .build()?;
        let database: DatabaseConfig = config.try_deserialize()?;
        database.validate()?;
        Ok(database)
    }

    /// Validate required fields and limits
    pub fn validate(&self) -> Result<(), DatabaseError> {
        if self.host.trim().is_empty() {
            return Err(DatabaseError::Config("Database host cannot be empty".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(DatabaseError::Config("Database user cannot be empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(DatabaseError::Config("Database name cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(DatabaseError::Config("Database port must be greater than 0".to_string()));
        }
        if self.max_connections == 0 {
            return Err(DatabaseError::Config(
                "Database max_connections must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(DatabaseError::Config(
                "Database connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(DatabaseError::Config(
                "Database query_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

/// Retry tuning for the transaction executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Total number of attempts per transaction
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub acquire_timeout_ms: u64,
    /// Random jitter added to each backoff (0.0 to 1.0 of the base delay)
    pub jitter_factor: f64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 100,
            acquire_timeout_ms: 10_000,
            jitter_factor: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub script_path: PathBuf,
    pub target_version: u32,
    pub version_table: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            script_path: PathBuf::from("schema/storefront.sql"),
            target_version: 1,
            version_table: "schema_version".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_port: None,
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
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), DatabaseError> {
        self.database.validate()?;

        if self.transaction.max_retries == 0 {
            return Err(DatabaseError::Config(
                "Transaction max_retries must be greater than 0".to_string(),
            ));
        }
        if self.transaction.acquire_timeout_ms == 0 {
            return Err(DatabaseError::Config(
                "Transaction acquire_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.schema.version_table.is_empty() {
            return Err(DatabaseError::Config(
                "Schema version_table cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
