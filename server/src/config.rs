use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub lease: LeaseConfig,
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Optional database URL. If not provided, defaults to a per-user file.
    pub url: Option<String>,
    /// Maximum number of database connections in the pool
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connection_timeout: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

/// Control-loop cadence and the staleness threshold.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LeaseConfig {
    /// A lease idle longer than this many hours is stale
    pub timeout_hours: i64,
    /// Reclaimer sweep period in seconds
    pub reclaimer_period_seconds: u64,
    /// Recurrence materializer sweep period in seconds
    pub recurrence_period_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryConfig {
    /// Page size applied when a caller omits a limit (hard ceiling 1000)
    pub default_limit: u32,
}

impl Config {
    /// Load configuration from the embedded defaults, an optional
    /// CONFIG_FILE, and BROKER_* environment variables.
    pub fn from_env() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = builder.add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(
                File::with_name(&config_file)
                    .required(false)
                    .format(FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            Environment::with_prefix("BROKER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Self::apply_standard_env_vars(&mut result)?;

        Ok(result)
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .add_source(File::with_name(path).format(FileFormat::Toml))
            .add_source(
                Environment::with_prefix("BROKER")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder
            .build()
            .context("Failed to build configuration from file")?;

        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration from file")?;
        Self::apply_standard_env_vars(&mut result)?;
        Ok(result)
    }

    /// Recognized standard environment variables, applied on top of the
    /// layered sources for deployment convenience.
    fn apply_standard_env_vars(config: &mut Config) -> Result<()> {
        if let Ok(database_url) = env::var("DATABASE_URL") {
            config.database.url = Some(database_url);
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.logging.level = log_level;
        }
        if let Ok(hours) = env::var("TASK_TIMEOUT_HOURS") {
            config.lease.timeout_hours = hours
                .parse()
                .context("TASK_TIMEOUT_HOURS must be an integer")?;
        }
        if let Ok(seconds) = env::var("RECLAIMER_PERIOD_SECONDS") {
            config.lease.reclaimer_period_seconds = seconds
                .parse()
                .context("RECLAIMER_PERIOD_SECONDS must be an integer")?;
        }
        if let Ok(seconds) = env::var("RECURRENCE_PERIOD_SECONDS") {
            config.lease.recurrence_period_seconds = seconds
                .parse()
                .context("RECURRENCE_PERIOD_SECONDS must be an integer")?;
        }
        if let Ok(limit) = env::var("DEFAULT_QUERY_LIMIT") {
            config.query.default_limit = limit
                .parse()
                .context("DEFAULT_QUERY_LIMIT must be an integer")?;
        }
        Ok(())
    }

    /// Get the database URL with a per-user fallback.
    pub fn database_url(&self) -> String {
        match &self.database.url {
            Some(url) => url.clone(),
            None => Self::default_database_url(),
        }
    }

    /// Default database location: XDG data dir when available, else home.
    pub fn default_database_url() -> String {
        if let Ok(xdg_data) = env::var("XDG_DATA_HOME") {
            return format!("sqlite://{xdg_data}/taskbroker/taskbroker.sqlite");
        }

        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        format!("sqlite://{home}/taskbroker.sqlite")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                ));
            }
        }

        let database_url = self.database_url();
        if !database_url.starts_with("sqlite://") && !database_url.starts_with(":memory:") {
            return Err(anyhow::anyhow!(
                "Only SQLite databases are supported. URL must start with 'sqlite://'. Got: {}",
                database_url
            ));
        }

        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!(
                "Database max_connections must be greater than 0"
            ));
        }
        if self.lease.timeout_hours <= 0 {
            return Err(anyhow::anyhow!("lease.timeout_hours must be positive"));
        }
        if self.lease.reclaimer_period_seconds == 0 || self.lease.recurrence_period_seconds == 0 {
            return Err(anyhow::anyhow!("loop periods must be greater than 0"));
        }
        if self.query.default_limit == 0 || self.query.default_limit > 1000 {
            return Err(anyhow::anyhow!(
                "query.default_limit must be between 1 and 1000"
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
                connection_timeout: 30,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            lease: LeaseConfig {
                timeout_hours: 24,
                reclaimer_period_seconds: 60,
                recurrence_period_seconds: 60,
            },
            query: QueryConfig { default_limit: 100 },
        }
    }
}
