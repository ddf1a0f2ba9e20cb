//! Core types used across the application
//!
//! Execution value objects shared by the queue payload, the worker pool,
//! the result store and the session manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Exit code reported when an execution exceeds its wall-clock timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Error type recorded for executions killed by the timeout wrapper
pub const TIMEOUT_ERROR: &str = "timeout_error";

/// Error type recorded when the worker exhausted its retries
pub const WORKER_ERROR: &str = "worker_error";

/// Upper bound accepted for `ExecutionConfig::timeout_seconds`
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;

/// Lower bound accepted for `ExecutionConfig::memory_limit_mb`
pub const MIN_MEMORY_LIMIT_MB: u64 = 4;

/// Resource and isolation settings copied into every task and sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    /// Wall-clock timeout per execution
    pub timeout_seconds: u64,
    /// Memory ceiling for the sandbox
    pub memory_limit_mb: u64,
    /// Number of CPUs the sandbox may use
    pub cpu_limit: f64,
    /// Mount the sandbox root filesystem read-only
    pub read_only_filesystem: bool,
    /// Detach the sandbox from every network
    pub disable_network: bool,
    /// Environment variables passed to the program
    pub environment: HashMap<String, String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            timeout_seconds: 30,
            memory_limit_mb: 512,
            cpu_limit: 1.0,
            read_only_filesystem: true,
            disable_network: true,
            environment: HashMap::new(),
        }
    }
}

impl ExecutionConfig {
    /// Set the timeout
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Set the memory limit
    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    /// Add environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Memory limit in bytes
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }

    /// Reject malformed configs before they are enqueued
    pub fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 {
            return Err(Error::InvalidInput("timeoutSeconds must be positive".into()));
        }
        if self.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Err(Error::InvalidInput(format!(
                "timeoutSeconds {} exceeds the maximum of {}",
                self.timeout_seconds, MAX_TIMEOUT_SECONDS
            )));
        }
        if self.memory_limit_mb < MIN_MEMORY_LIMIT_MB {
            return Err(Error::InvalidInput(format!(
                "memoryLimitMB must be at least {}",
                MIN_MEMORY_LIMIT_MB
            )));
        }
        if !self.cpu_limit.is_finite() || self.cpu_limit <= 0.0 {
            return Err(Error::InvalidInput("cpuLimit must be a positive number".into()));
        }
        for key in self.environment.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(Error::InvalidInput(format!(
                    "Invalid environment variable name: {:?}",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Environment rendered as `KEY=VALUE` pairs
    pub fn env_pairs(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Status of a stored execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Timeout
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            _ => Err(Error::InvalidInput(format!("Unknown status: {}", s))),
        }
    }
}

/// Stored record of one execution, as returned by status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub timeout: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    /// A fresh record in the given status
    pub fn new(execution_id: Uuid, status: ExecutionStatus) -> Self {
        ExecutionResult {
            execution_id,
            status,
            exit_code: None,
            stdout: None,
            stderr: None,
            duration_ms: None,
            timeout: false,
            error_type: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Terminal once an exit code has been recorded
    pub fn is_terminal(&self) -> bool {
        self.exit_code.is_some()
    }
}

/// Raw output of one backend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    /// Process exit code
    pub exit_code: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Wall-clock time spent
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Was execution terminated due to timeout?
    pub timed_out: bool,
    /// Error classification, if any
    pub error_type: Option<String>,
}

impl RunOutput {
    /// Output of a process that ran to completion
    pub fn finished(exit_code: i32, stdout: String, stderr: String, duration: Duration) -> Self {
        RunOutput {
            exit_code,
            stdout,
            stderr,
            duration,
            timed_out: false,
            error_type: None,
        }
    }

    /// Output of a process killed by the timeout wrapper
    pub fn timed_out(partial_stdout: String, partial_stderr: String, duration: Duration) -> Self {
        RunOutput {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: partial_stdout,
            stderr: partial_stderr,
            duration,
            timed_out: true,
            error_type: Some(TIMEOUT_ERROR.to_string()),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ExecutionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_malformed_config_rejected() {
        let zero_timeout = ExecutionConfig::default().with_timeout_seconds(0);
        assert!(matches!(zero_timeout.validate(), Err(Error::InvalidInput(_))));

        let tiny_memory = ExecutionConfig::default().with_memory_limit_mb(1);
        assert!(tiny_memory.validate().is_err());

        let bad_env = ExecutionConfig::default().with_env("A=B", "c");
        assert!(bad_env.validate().is_err());

        let mut no_cpu = ExecutionConfig::default();
        no_cpu.cpu_limit = 0.0;
        assert!(no_cpu.validate().is_err());
    }

    #[test]
    fn test_config_wire_format() {
        let json = r#"{"timeoutSeconds": 5, "disableNetwork": false}"#;
        let config: ExecutionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.timeout_seconds, 5);
        assert!(!config.disable_network);
        assert_eq!(config.memory_limit_mb, 512);
    }

    #[test]
    fn test_timed_out_output() {
        let out = RunOutput::timed_out("partial".into(), String::new(), Duration::from_secs(5));
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(out.error_type.as_deref(), Some(TIMEOUT_ERROR));
        assert!(!out.success());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Completed".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Completed);
        assert!("done".parse::<ExecutionStatus>().is_err());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
