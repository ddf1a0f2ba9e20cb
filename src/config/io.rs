//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file (config.json / config.toml) if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    // Detect format by extension
    let config: Config = if path.extension().is_some_and(|ext| ext == "json") {
        // Parse as JSON5 (more lenient than strict JSON)
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        // Try JSON5 first, then TOML
        json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` if present, then overlays any set `SANDRUN_*` variables.
/// Unparseable values are ignored.
pub fn apply_env_overrides(config: &mut Config) {
    dotenvy::dotenv().ok();

    // Queue and storage locations
    if let Ok(dir) = std::env::var("SANDRUN_QUEUE_DIR") {
        config.queue.dir = std::path::PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("SANDRUN_RESULTS_DIR") {
        config.storage.results_dir = std::path::PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("SANDRUN_WORKSPACE_DIR") {
        config.sessions.workspace_root = std::path::PathBuf::from(dir);
    }

    // Worker overrides
    if let Ok(v) = std::env::var("SANDRUN_MAX_CONCURRENCY") {
        if let Ok(v) = v.parse() {
            config.worker.max_concurrency = v;
        }
    }
    if let Ok(v) = std::env::var("SANDRUN_MAX_RETRIES") {
        if let Ok(v) = v.parse() {
            config.worker.max_retries = v;
        }
    }
    if let Ok(v) = std::env::var("SANDRUN_RUNTIME_PREFERENCE") {
        if let Ok(v) = v.parse() {
            config.worker.runtime_preference = v;
        }
    }

    // Execution defaults
    if let Ok(v) = std::env::var("SANDRUN_DEFAULT_TIMEOUT") {
        if let Ok(v) = v.parse() {
            config.execution.timeout_seconds = v;
        }
    }

    // Session overrides
    if let Ok(v) = std::env::var("SANDRUN_DEFAULT_SESSION_RUNTIME") {
        config.sessions.default_runtime = v;
    }
}

/// Save configuration to a file
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::to_string_pretty(config).map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        serde_json::to_string_pretty(config).map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_config.json");

        let mut config = Config::default();
        config.worker.max_concurrency = 11;
        save_config(&config, &path).unwrap();

        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded.worker.max_concurrency, 11);
        assert_eq!(loaded.queue.poll_interval, config.queue.poll_interval);
    }

    #[test]
    fn test_load_json5_with_comments() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // trailing commas and comments are fine
                queue: { claim_timeout: "2s", },
                execution: { timeoutSeconds: 9 },
            }"#,
        )
        .unwrap();

        let loaded = load_config_from_path(&path).unwrap();
        assert_eq!(loaded.queue.claim_timeout, std::time::Duration::from_secs(2));
        assert_eq!(loaded.execution.timeout_seconds, 9);
    }

    #[test]
    fn test_invalid_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "worker = [").unwrap();

        assert!(matches!(load_config_from_path(&path), Err(Error::Config(_))));
    }
}
