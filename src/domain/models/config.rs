//! Runtime configuration model.
//!
//! Loaded by the figment-based loader in `infrastructure::config` from
//! defaults, a YAML file, and `GANTRY_`-prefixed environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub dispatch: DispatchConfig,
    pub janitor: JanitorConfig,
    pub stats: StatsConfig,
    pub webhook: WebhookConfig,
}

/// SQLite settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "gantry.db".to_string(),
            max_connections: 5,
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            enable_cors: true,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error
    pub level: String,
    /// json | pretty
    pub format: String,
    /// Directory for daily-rotated log files; stdout only when unset
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

/// Dispatch-path timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Heartbeat staleness threshold
    pub heartbeat_timeout_secs: u64,
    /// How long an offline worker's tasks are left alone before requeue
    pub grace_period_secs: u64,
    /// Global task execution timeout (per-endpoint override wins)
    pub task_timeout_secs: u64,
    /// Concurrency assigned to workers that never reported one
    pub default_concurrency: u32,
    /// Poll interval for synchronous submits
    pub sync_poll_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 90,
            grace_period_secs: 180,
            task_timeout_secs: 600,
            default_concurrency: 1,
            sync_poll_interval_secs: 1,
        }
    }
}

impl DispatchConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Janitor job intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    /// Stale-worker sweep; defaults to heartbeat_timeout / 2 when zero
    pub offline_workers_interval_secs: u64,
    pub timed_out_tasks_interval_secs: u64,
    pub orphaned_tasks_interval_secs: u64,
    pub refresh_statistics_interval_secs: u64,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            offline_workers_interval_secs: 0,
            timed_out_tasks_interval_secs: 60,
            orphaned_tasks_interval_secs: 60,
            refresh_statistics_interval_secs: 300,
        }
    }
}

/// Fire-and-forget statistics queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub queue_capacity: usize,
    pub drain_workers: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            drain_workers: 2,
        }
    }
}

/// Webhook delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.dispatch.heartbeat_timeout_secs, 90);
        assert_eq!(config.dispatch.grace_period_secs, 180);
        assert_eq!(config.dispatch.task_timeout_secs, 600);
        assert_eq!(config.dispatch.default_concurrency, 1);
        assert_eq!(config.webhook.timeout_secs, 30);
    }
}
