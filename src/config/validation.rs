//! Configuration validation
//!
//! Validates configuration and reports issues.

use std::time::Duration;

use super::types::Config;

/// Shortest `queue.stale_after` accepted without a warning
const MIN_STALE_AFTER: Duration = Duration::from_secs(30);

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_worker_config(config, result);
    result = validate_queue_config(config, result);
    result = validate_session_config(config, result);
    result = validate_monitor_config(config, result);

    if let Err(e) = config.execution.validate() {
        result = result.with_error(ValidationIssue::new("execution", e.to_string()));
    }

    result
}

fn validate_worker_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.worker.max_concurrency == 0 {
        result = result.with_error(
            ValidationIssue::new("worker.max_concurrency", "Concurrency must be at least 1")
                .with_suggestion("Set worker.max_concurrency or SANDRUN_MAX_CONCURRENCY"),
        );
    }

    if config.worker.prepare_timeout.is_zero() {
        result = result.with_error(ValidationIssue::new(
            "worker.prepare_timeout",
            "Runtime preparation timeout must be positive",
        ));
    }

    if config.worker.max_retries > 10 {
        result = result.with_warning(ValidationIssue::new(
            "worker.max_retries",
            format!(
                "{} retries with exponential backoff can hold a task for a very long time",
                config.worker.max_retries
            ),
        ));
    }

    result
}

fn validate_queue_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.queue.poll_interval.is_zero() {
        result = result.with_error(ValidationIssue::new(
            "queue.poll_interval",
            "Poll interval must be positive",
        ));
    }
    if config.sessions.cleanup_interval.is_zero() {
        result = result.with_error(ValidationIssue::new(
            "sessions.cleanup_interval",
            "Cleanup interval must be positive",
        ));
    }

    // Running units renew their claim every quarter of this threshold
    if config.queue.stale_after.is_zero() {
        result = result.with_error(ValidationIssue::new(
            "queue.stale_after",
            "Stale threshold must be positive",
        ));
    } else if config.queue.stale_after < MIN_STALE_AFTER {
        result = result.with_warning(
            ValidationIssue::new(
                "queue.stale_after",
                format!(
                    "A stale threshold under {:?} can reclaim tasks from workers that stall briefly",
                    MIN_STALE_AFTER
                ),
            )
            .with_suggestion("Keep queue.stale_after at 30 seconds or more"),
        );
    }

    result
}

fn validate_session_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let known = ["docker", "workspace"];
    if !known.contains(&config.sessions.default_runtime.as_str()) {
        result = result.with_error(
            ValidationIssue::new(
                "sessions.default_runtime",
                format!("Unknown session runtime: {}", config.sessions.default_runtime),
            )
            .with_suggestion("Use one of: docker, workspace"),
        );
    }

    if config.sessions.max_lifetime_minutes < config.sessions.idle_timeout_minutes {
        result = result.with_warning(ValidationIssue::new(
            "sessions.max_lifetime_minutes",
            "Max lifetime is shorter than the idle timeout; idle expiry will never trigger",
        ));
    }

    result
}

fn validate_monitor_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.monitor.history_size == 0 {
        result = result.with_error(ValidationIssue::new(
            "monitor.history_size",
            "History size must be at least 1",
        ));
    }

    let ratio = config.monitor.memory_warning_ratio;
    if !(ratio > 0.0 && ratio <= 1.0) {
        result = result.with_error(ValidationIssue::new(
            "monitor.memory_warning_ratio",
            format!("Warning ratio must be in (0, 1], got {}", ratio),
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        let result = validate_config(&config);

        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_invalid_values_reported() {
        let mut config = Config::default();
        config.worker.max_concurrency = 0;
        config.monitor.memory_warning_ratio = 1.5;
        config.sessions.default_runtime = "firecracker".into();
        config.queue.stale_after = Duration::ZERO;
        config.worker.prepare_timeout = Duration::ZERO;

        let result = validate_config(&config);
        assert!(!result.valid);
        let paths: Vec<&str> = result.errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"worker.max_concurrency"));
        assert!(paths.contains(&"monitor.memory_warning_ratio"));
        assert!(paths.contains(&"sessions.default_runtime"));
        assert!(paths.contains(&"queue.stale_after"));
        assert!(paths.contains(&"worker.prepare_timeout"));
    }

    #[test]
    fn test_short_stale_threshold_warns() {
        let mut config = Config::default();
        config.queue.stale_after = std::time::Duration::from_secs(10);

        let result = validate_config(&config);
        assert!(result.valid);
        assert!(result.warnings.iter().any(|w| w.path == "queue.stale_after"));
    }
}
