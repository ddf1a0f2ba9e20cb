//! Runtime module - Interchangeable sandbox backends
//!
//! Every backend exposes the same capability surface (`Backend`) so the
//! selector can rank them. Two flavours build on it:
//! - `Runtime`: one-shot execution of a code snippet (used by the worker pool)
//! - `SandboxProvider` (in `crate::session`): long-lived sandboxes for sessions
//!
//! Concrete runtimes:
//! - Process mode: native interpreters (deno, bun, python, node, sh)
//! - Container mode: ephemeral Docker containers

pub(crate) mod container;
mod process;
mod registry;

pub use container::ContainerRuntime;
pub use process::ProcessRuntime;
pub use registry::RuntimeRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::core::{ExecutionConfig, RunOutput};
use crate::error::{Error, Result};

/// Static descriptor of a backend, used only for selection scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCapabilities {
    /// Typical cold-start latency
    pub startup_time_ms: u64,
    /// Memory consumed by the backend itself
    pub memory_overhead_mb: u64,
    /// Relative isolation strength, higher is stronger
    pub isolation_level: u32,
    pub supports_filesystem_persistence: bool,
    pub supports_network_access: bool,
    pub max_concurrent_executions: usize,
}

/// Ranking policy used by `RuntimeRegistry::select_best`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimePreference {
    /// Lowest startup time
    Speed,
    /// Strongest isolation
    Security,
    /// Lowest memory overhead
    Memory,
    /// Normalized composite of all three
    #[default]
    Balanced,
}

impl std::str::FromStr for RuntimePreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "speed" | "fast" => Ok(RuntimePreference::Speed),
            "security" | "secure" => Ok(RuntimePreference::Security),
            "memory" => Ok(RuntimePreference::Memory),
            "balanced" => Ok(RuntimePreference::Balanced),
            _ => Err(Error::InvalidInput(format!(
                "Unknown runtime preference: {}. Valid: speed, security, memory, balanced",
                s
            ))),
        }
    }
}

impl std::fmt::Display for RuntimePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimePreference::Speed => write!(f, "speed"),
            RuntimePreference::Security => write!(f, "security"),
            RuntimePreference::Memory => write!(f, "memory"),
            RuntimePreference::Balanced => write!(f, "balanced"),
        }
    }
}

/// Capability surface shared by every backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Languages / environment names this backend can serve
    fn supported_environments(&self) -> Vec<String>;

    /// Whether the backend can take work right now
    async fn is_available(&self) -> bool;

    /// Static capabilities for selection
    fn capabilities(&self) -> RuntimeCapabilities;

    /// Check if an environment is supported
    fn supports(&self, environment: &str) -> bool {
        let environment = environment.to_lowercase();
        self.supported_environments()
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&environment))
    }
}

/// Trait for one-shot code execution backends
#[async_trait]
pub trait Runtime: Backend {
    /// Ready the backend for `language` (e.g. pull its image). Runs outside
    /// the execution timeout.
    async fn prepare(&self, _language: &str) -> Result<()> {
        Ok(())
    }

    /// Execute code; the wall-clock timeout in `config` is enforced here
    async fn execute(&self, language: &str, code: &str, config: &ExecutionConfig) -> Result<RunOutput>;
}

/// Build the default one-shot runtime registry from configuration.
///
/// Process runtimes are always registered; the container runtime only when
/// a Docker daemon answers.
pub async fn default_registry(config: &Config) -> RuntimeRegistry<dyn Runtime> {
    let mut registry: RuntimeRegistry<dyn Runtime> = RuntimeRegistry::new();

    match ContainerRuntime::connect(&config.container).await {
        Ok(container) => registry.register(Arc::new(container)),
        Err(e) => tracing::warn!("Container runtime disabled: {}", e),
    }

    registry.register(Arc::new(ProcessRuntime::deno()));
    registry.register(Arc::new(ProcessRuntime::bun()));
    registry.register(Arc::new(ProcessRuntime::python()));
    registry.register(Arc::new(ProcessRuntime::node()));
    registry.register(Arc::new(ProcessRuntime::shell()));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preference_parsing() {
        assert_eq!("speed".parse::<RuntimePreference>().unwrap(), RuntimePreference::Speed);
        assert_eq!("SECURE".parse::<RuntimePreference>().unwrap(), RuntimePreference::Security);
        assert!("cheap".parse::<RuntimePreference>().is_err());
        assert_eq!(RuntimePreference::default(), RuntimePreference::Balanced);
    }
}
