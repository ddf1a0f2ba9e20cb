//! Configuration types module
//!
//! Core configuration types for the queue, worker pool and result storage.
//! Sandbox-facing settings live in `sandbox.rs`.

pub mod sandbox;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::ExecutionConfig;
use crate::runtime::RuntimePreference;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Task queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Result storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Session defaults
    #[serde(default)]
    pub sessions: sandbox::SessionDefaults,

    /// Result cache configuration
    #[serde(default)]
    pub cache: sandbox::CacheConfig,

    /// Resource monitor configuration
    #[serde(default)]
    pub monitor: sandbox::MonitorConfig,

    /// Container backend configuration
    #[serde(default)]
    pub container: sandbox::ContainerConfig,

    /// Default execution limits for submissions that omit them
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl Config {
    /// Load configuration from environment variables and files
    ///
    /// It loads configuration from:
    /// 1. Default values
    /// 2. Config file (if present)
    /// 3. Environment variable overrides
    pub fn from_env() -> crate::error::Result<Self> {
        crate::config::load_config()
    }
}

/// Filesystem task queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Root directory holding the pending/processing areas
    #[serde(default = "default_queue_dir")]
    pub dir: PathBuf,
    /// Delay between claim attempts while the queue is empty
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// How long one claim call waits before giving up
    #[serde(with = "humantime_serde", default = "default_claim_timeout")]
    pub claim_timeout: Duration,
    /// Processing entries older than this are moved back to pending
    #[serde(with = "humantime_serde", default = "default_stale_after")]
    pub stale_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            dir: default_queue_dir(),
            poll_interval: default_poll_interval(),
            claim_timeout: default_claim_timeout(),
            stale_after: default_stale_after(),
        }
    }
}

fn default_queue_dir() -> PathBuf {
    super::paths::data_dir().join("queue")
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_claim_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(15 * 60)
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum simultaneous executions
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential backoff; retry n waits `retry_base * 2^n`
    #[serde(with = "humantime_serde", default = "default_retry_base")]
    pub retry_base: Duration,
    /// Slack added to the execution timeout by the wrapper
    #[serde(with = "humantime_serde", default = "default_timeout_grace")]
    pub timeout_grace: Duration,
    /// How long in-flight executions may run after shutdown begins
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,
    /// How often stale processing entries are reclaimed
    #[serde(with = "humantime_serde", default = "default_reclaim_interval")]
    pub reclaim_interval: Duration,
    /// Bound on readying a runtime (image pulls) before the timed execution
    #[serde(with = "humantime_serde", default = "default_prepare_timeout")]
    pub prepare_timeout: Duration,
    /// Backend ranking policy
    #[serde(default)]
    pub runtime_preference: RuntimePreference,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            retry_base: default_retry_base(),
            timeout_grace: default_timeout_grace(),
            shutdown_grace: default_shutdown_grace(),
            reclaim_interval: default_reclaim_interval(),
            prepare_timeout: default_prepare_timeout(),
            runtime_preference: RuntimePreference::default(),
        }
    }
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base() -> Duration {
    Duration::from_secs(1)
}

fn default_timeout_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_reclaim_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_prepare_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Result storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one JSON file per execution
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            results_dir: default_results_dir(),
        }
    }
}

fn default_results_dir() -> PathBuf {
    super::paths::data_dir().join("results")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.worker.max_concurrency, 4);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.queue.poll_interval, Duration::from_millis(100));
        assert!(config.queue.dir.ends_with("queue"));
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [worker]
            max_concurrency = 8
            retry_base = "250ms"
            runtime_preference = "speed"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.max_concurrency, 8);
        assert_eq!(config.worker.retry_base, Duration::from_millis(250));
        assert_eq!(config.worker.runtime_preference, RuntimePreference::Speed);
        assert_eq!(config.worker.max_retries, 3);
    }
}
