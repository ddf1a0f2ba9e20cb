//! Long-lived sandbox contract used by sessions
//!
//! A `SandboxProvider` is a `Backend` that can keep a sandbox alive between
//! commands. Two providers ship with the crate:
//! - `DockerSandbox`: a container idling on `sleep infinity`, commands via exec
//! - `WorkspaceSandbox`: a native per-session directory, commands via `sh -c`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::core::{ExecutionConfig, RunOutput};
use crate::error::Result;
use crate::monitor::ResourceUsage;
use crate::runtime::Backend;

/// Reference to one live sandbox
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Provider-specific id (container id, directory path)
    pub id: String,
    /// Name of the provider that owns the sandbox
    pub provider: String,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        SandboxHandle {
            id: id.into(),
            provider: provider.into(),
        }
    }
}

impl std::fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.id)
    }
}

/// What a provider needs to allocate a sandbox
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub session_id: Uuid,
    pub language: String,
    /// Image override; providers fall back to their per-language default
    pub image: Option<String>,
    /// Keep the writable layer across commands
    pub persist_filesystem: bool,
    /// Resource limits and environment
    pub limits: ExecutionConfig,
}

/// Deterministic sandbox name for a session, so a restarted process can find it again
pub fn sandbox_name(session_id: Uuid) -> String {
    format!("sandrun-session-{}", session_id)
}

/// Trait for providers of long-lived sandboxes
#[async_trait]
pub trait SandboxProvider: Backend {
    /// Allocate and start a sandbox that stays up until `destroy`
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;

    /// Run one command inside the sandbox
    async fn exec(&self, handle: &SandboxHandle, command: &str, timeout: Duration) -> Result<RunOutput>;

    /// Stop and remove the sandbox. A sandbox that is already gone is not an error.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<()>;

    /// Point-in-time resource usage
    async fn stats(&self, handle: &SandboxHandle) -> Result<ResourceUsage>;

    /// Find the live sandbox belonging to a session, if any
    async fn resolve(&self, session_id: Uuid) -> Result<Option<SandboxHandle>>;
}
