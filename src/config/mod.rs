//! Configuration module - Modular configuration management
//!
//! - types/mod.rs: Core configuration types (Config, QueueConfig, WorkerConfig, StorageConfig)
//! - types/sandbox.rs: Container, session, cache and monitor configuration
//! - io.rs: Configuration loading and saving
//! - validation.rs: Configuration validation
//! - paths.rs: Configuration file paths

mod io;
pub mod paths;
mod types;
mod validation;

// Re-export core config types
pub use types::{Config, QueueConfig, StorageConfig, WorkerConfig};

// Re-export sandbox types
pub use types::sandbox::{
    CacheConfig, ContainerConfig, LanguageImage, MonitorConfig, SessionDefaults,
};

// Re-export IO and utilities
pub use io::{apply_env_overrides, load_config, load_config_from_path, save_config};
pub use paths::{config_dir, config_path, data_dir};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
