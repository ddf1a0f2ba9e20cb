//! Sandbox configuration types
//!
//! Configuration for container images, session defaults, the result cache
//! and the resource monitor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Container (Docker) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Network mode used when a config allows network access
    #[serde(default = "default_network")]
    pub network: String,
    /// Maximum processes inside one container
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
    /// Size of the writable /tmp mount
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size_mb: u64,
    /// Image and interpreter per language
    #[serde(default = "default_languages")]
    pub languages: HashMap<String, LanguageImage>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            network: default_network(),
            pids_limit: default_pids_limit(),
            tmpfs_size_mb: default_tmpfs_size(),
            languages: default_languages(),
        }
    }
}

impl ContainerConfig {
    /// Image used for a language, if configured
    pub fn image_for(&self, language: &str) -> Option<&str> {
        self.languages
            .get(&language.to_lowercase())
            .map(|l| l.image.as_str())
    }
}

/// Image and interpreter command for one language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageImage {
    /// Docker image
    pub image: String,
    /// Interpreter prefix; the code is appended as the last argument
    pub command: Vec<String>,
}

impl LanguageImage {
    pub fn new(image: &str, command: &[&str]) -> Self {
        LanguageImage {
            image: image.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn default_network() -> String {
    "bridge".to_string()
}

fn default_pids_limit() -> i64 {
    128
}

fn default_tmpfs_size() -> u64 {
    64
}

fn default_languages() -> HashMap<String, LanguageImage> {
    HashMap::from([
        (
            "python".to_string(),
            LanguageImage::new("python:3.12-slim", &["python3", "-c"]),
        ),
        (
            "javascript".to_string(),
            LanguageImage::new("node:20-slim", &["node", "-e"]),
        ),
        (
            "typescript".to_string(),
            LanguageImage::new("denoland/deno:latest", &["deno", "eval", "--ext=ts"]),
        ),
        (
            "bash".to_string(),
            LanguageImage::new("bash:5.2", &["bash", "-c"]),
        ),
    ])
}

/// Defaults applied to sessions that do not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaults {
    /// Close a session after this long without a command
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_minutes: u64,
    /// Close a session this long after creation regardless of activity
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_minutes: u64,
    /// Per-command timeout inside a session
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_seconds: u64,
    /// How often the expiry and monitoring sweep runs
    #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
    pub cleanup_interval: Duration,
    /// Root for native workspace sandboxes
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// Provider used when a session names neither a runtime nor a preference
    #[serde(default = "default_runtime")]
    pub default_runtime: String,
    /// Where `sandrun worker` persists the session table on shutdown
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        SessionDefaults {
            idle_timeout_minutes: default_idle_timeout(),
            max_lifetime_minutes: default_max_lifetime(),
            exec_timeout_seconds: default_exec_timeout(),
            cleanup_interval: default_cleanup_interval(),
            workspace_root: default_workspace_root(),
            default_runtime: default_runtime(),
            snapshot_path: default_snapshot_path(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_max_lifetime() -> u64 {
    240
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_workspace_root() -> PathBuf {
    crate::config::paths::data_dir().join("sessions")
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_snapshot_path() -> PathBuf {
    crate::config::paths::data_dir().join("sessions.json")
}

/// Result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached outputs
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// Lifetime of a cached output
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: default_max_entries(),
            ttl: default_ttl(),
        }
    }
}

fn default_max_entries() -> u64 {
    1000
}

fn default_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Resource monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Samples kept per sandbox for trend queries
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Memory warning threshold as a fraction of the hard limit
    #[serde(default = "default_warning_ratio")]
    pub memory_warning_ratio: f64,
    /// CPU quota in percent of one core
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota_percent: f64,
    /// Disk quota per sandbox
    #[serde(default = "default_disk_limit")]
    pub disk_limit_mb: u64,
    /// Process count ceiling per sandbox
    #[serde(default = "default_max_processes")]
    pub max_processes: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            history_size: default_history_size(),
            memory_warning_ratio: default_warning_ratio(),
            cpu_quota_percent: default_cpu_quota(),
            disk_limit_mb: default_disk_limit(),
            max_processes: default_max_processes(),
        }
    }
}

fn default_history_size() -> usize {
    60
}

fn default_warning_ratio() -> f64 {
    0.8
}

fn default_cpu_quota() -> f64 {
    100.0
}

fn default_disk_limit() -> u64 {
    1024
}

fn default_max_processes() -> u64 {
    64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config_default() {
        let config = ContainerConfig::default();
        assert_eq!(config.image_for("Python"), Some("python:3.12-slim"));
        assert_eq!(config.image_for("cobol"), None);
        assert_eq!(config.languages["bash"].command, vec!["bash", "-c"]);
    }

    #[test]
    fn test_session_defaults() {
        let defaults = SessionDefaults::default();
        assert_eq!(defaults.idle_timeout_minutes, 30);
        assert_eq!(defaults.default_runtime, "docker");
        assert_eq!(defaults.cleanup_interval, Duration::from_secs(60));
    }
}
