//! Configuration management.
//!
//! Values come from an optional file plus `TASKQ__`-prefixed environment
//! variables, e.g. `TASKQ__WORKER__POLL_INTERVAL=250ms` or
//! `TASKQ__DATABASE__URL=postgres://...`.

use serde::Deserialize;
use std::time::Duration;

use crate::domain::RetryPolicy;

const ENV_PREFIX: &str = "TASKQ";

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(#[from] config::ConfigError);

/// Main configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskqConfig {
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Backoff and ceiling applied to failing tasks
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue has nothing eligible
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Number of worker loops spawned in this process
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound for a single handler invocation
    #[serde(with = "humantime_serde", default)]
    pub handler_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            concurrency: default_concurrency(),
            handler_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Unset means the in-memory store.
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_concurrency() -> usize {
    1
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TaskqConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(environment())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load from a specific file path; the environment still overrides it.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(environment())
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> TaskqConfig {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn empty_source_yields_defaults() {
        let cfg = from_toml("");
        assert_eq!(cfg.worker.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.worker.concurrency, 1);
        assert_eq!(cfg.worker.handler_timeout, None);
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert!(cfg.database.url.is_none());
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn durations_use_humantime() {
        let cfg = from_toml(
            r#"
            [worker]
            poll_interval = "250ms"
            handler_timeout = "30s"
            concurrency = 4

            [retry]
            base_delay = "2s"
            max_delay = "1m"
            ceiling = 50
            "#,
        );
        assert_eq!(cfg.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.worker.handler_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.worker.concurrency, 4);
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(2));
        assert_eq!(cfg.retry.max_delay, Duration::from_secs(60));
        assert_eq!(cfg.retry.ceiling, Some(50));
    }
}
