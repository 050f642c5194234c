//! Configuration management for the server.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use replica_engine::EngineConfig;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Namespace of the hosted registry
    pub namespace: String,
    /// Store name of the hosted registry
    pub store: String,
    /// Quiet period before a changed replica is persisted
    pub save_debounce: Duration,
    /// Interval between idle-eviction sweeps
    pub eviction_interval: Duration,
    /// How long a request sent to clients waits for answers
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let namespace = env::var("REPLICA_NAMESPACE").unwrap_or_else(|_| "app".to_string());
        let store = env::var("REPLICA_STORE").unwrap_or_else(|_| "main".to_string());

        let save_debounce = Duration::from_millis(parse_or("SAVE_DEBOUNCE_MS", 500)?);
        let eviction_interval = Duration::from_secs(parse_or("EVICTION_INTERVAL_SECS", 30)?);
        let request_timeout = Duration::from_millis(parse_or("REQUEST_TIMEOUT_MS", 2000)?);

        Ok(Self {
            host,
            port,
            database_url,
            namespace,
            store,
            save_debounce,
            eviction_interval,
            request_timeout,
        })
    }

    /// Engine settings for the hosted coordinator.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig::default()
            .with_save_debounce(self.save_debounce)
            .with_eviction_interval(self.eviction_interval)
    }
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {0} value")]
    Invalid(&'static str),
}
