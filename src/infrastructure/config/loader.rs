//! Configuration loading with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid heartbeat_timeout_secs: {0}. Must be positive")]
    InvalidHeartbeatTimeout(u64),

    #[error(
        "Invalid grace_period_secs: {grace}. Must be at least heartbeat_timeout_secs ({heartbeat})"
    )]
    InvalidGracePeriod { grace: u64, heartbeat: u64 },

    #[error("Invalid task_timeout_secs: {0}. Must be positive")]
    InvalidTaskTimeout(u64),

    #[error("Invalid default_concurrency: {0}. Must be at least 1")]
    InvalidConcurrency(u32),

    #[error("Invalid stats queue_capacity: {0}. Must be at least 1")]
    InvalidQueueCapacity(usize),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. gantry.yaml in the working directory
    /// 3. Environment variables (GANTRY_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file("gantry.yaml"))
            .merge(Env::prefixed("GANTRY_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("GANTRY_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(
                config.database.max_connections,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.dispatch.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::InvalidHeartbeatTimeout(
                config.dispatch.heartbeat_timeout_secs,
            ));
        }
        if config.dispatch.grace_period_secs < config.dispatch.heartbeat_timeout_secs {
            return Err(ConfigError::InvalidGracePeriod {
                grace: config.dispatch.grace_period_secs,
                heartbeat: config.dispatch.heartbeat_timeout_secs,
            });
        }
        if config.dispatch.task_timeout_secs == 0 {
            return Err(ConfigError::InvalidTaskTimeout(
                config.dispatch.task_timeout_secs,
            ));
        }
        if config.dispatch.default_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(
                config.dispatch.default_concurrency,
            ));
        }
        if config.stats.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity(config.stats.queue_capacity));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_grace_shorter_than_heartbeat_rejected() {
        let mut config = Config::default();
        config.dispatch.grace_period_secs = 30;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidGracePeriod { .. })
        ));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }
}
