//! Configuration paths
//!
//! Utilities for resolving configuration and data directories.

use std::path::PathBuf;

/// Get the configuration directory
pub fn config_dir() -> PathBuf {
    // Check for explicit override
    if let Ok(dir) = std::env::var("SANDRUN_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    // Use XDG config directory or fallback
    dirs::config_dir()
        .map(|d| d.join("sandrun"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".config").join("sandrun"))
                .unwrap_or_else(|| PathBuf::from(".sandrun"))
        })
}

/// Get the main configuration file path
pub fn config_path() -> PathBuf {
    // Check for explicit override
    if let Ok(path) = std::env::var("SANDRUN_CONFIG") {
        return PathBuf::from(path);
    }

    config_dir().join("config.json")
}

/// Get the data directory (queue, results, session workspaces)
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SANDRUN_HOME") {
        return PathBuf::from(dir);
    }

    dirs::data_dir()
        .map(|d| d.join("sandrun"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .map(|h| h.join(".local").join("share").join("sandrun"))
                .unwrap_or_else(|| PathBuf::from(".sandrun"))
        })
}
