//! # Sandrun
//!
//! Execution orchestration for untrusted code, built on filesystem
//! primitives and in-process concurrency control.
//!
//! ## Components
//!
//! - **TaskQueue:** durable filesystem FIFO with rename-based claims
//! - **WorkerPool:** bounded-concurrency consumer with retry and backoff
//! - **SessionManager:** long-lived sandboxes reused across commands
//! - **ResourceMonitor:** usage sampling and quota violation checks
//! - **RuntimeRegistry:** interchangeable backends ranked by preference
//! - **ResultCache:** TTL-bounded memoization of command outputs

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod monitor;
pub mod queue;
pub mod runtime;
pub mod service;
pub mod session;
pub mod worker;

pub use cache::ResultCache;
pub use config::Config;
pub use core::{ExecutionConfig, ExecutionResult, ExecutionStatus, FileResultStore, ResultStore};
pub use error::{Error, Result};
pub use monitor::ResourceMonitor;
pub use queue::{Task, TaskQueue};
pub use runtime::{Runtime, RuntimePreference, RuntimeRegistry};
pub use service::ExecutionService;
pub use session::{SessionConfig, SessionManager};
pub use worker::{WorkerPool, WorkerReport};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
