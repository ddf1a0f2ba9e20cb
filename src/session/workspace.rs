//! Native workspace sandboxes
//!
//! A session gets its own directory under the workspace root and commands
//! run there through `sh -c` with a scrubbed environment. No kernel-level
//! isolation; suited to trusted hosts and tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sandbox::{sandbox_name, SandboxHandle, SandboxProvider, SandboxSpec};
use crate::core::RunOutput;
use crate::error::{Error, Result};
use crate::monitor::ResourceUsage;
use crate::runtime::{Backend, RuntimeCapabilities};

/// Provider name used in handles and `runtimeType`
pub const WORKSPACE_PROVIDER: &str = "workspace";

/// Per-session working directories on the host
pub struct WorkspaceSandbox {
    root: PathBuf,
    environments: Vec<String>,
}

impl WorkspaceSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkspaceSandbox {
            root: root.into(),
            environments: vec!["bash".to_string(), "sh".to_string(), "shell".to_string()],
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, session_id: Uuid) -> PathBuf {
        self.root.join(sandbox_name(session_id))
    }

    /// Environment is kept beside the directory so it survives a restore
    fn env_file(dir: &Path) -> PathBuf {
        dir.with_extension("env.json")
    }

    async fn load_env(dir: &Path) -> HashMap<String, String> {
        match tokio::fs::read(Self::env_file(dir)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }
}

fn disk_usage(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => disk_usage(&entry.path()),
            Ok(ft) if ft.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

#[async_trait]
impl Backend for WorkspaceSandbox {
    fn name(&self) -> &str {
        WORKSPACE_PROVIDER
    }

    fn supported_environments(&self) -> Vec<String> {
        self.environments.clone()
    }

    async fn is_available(&self) -> bool {
        which::which("sh").is_ok()
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            startup_time_ms: 5,
            memory_overhead_mb: 2,
            isolation_level: 1,
            supports_filesystem_persistence: true,
            supports_network_access: true,
            max_concurrent_executions: 16,
        }
    }
}

#[async_trait]
impl SandboxProvider for WorkspaceSandbox {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let dir = self.dir_for(spec.session_id);
        tokio::fs::create_dir_all(&dir).await?;
        let env = serde_json::to_vec(&spec.limits.environment)?;
        tokio::fs::write(Self::env_file(&dir), env).await?;

        info!("Workspace {} created", dir.display());
        Ok(SandboxHandle::new(dir.to_string_lossy(), WORKSPACE_PROVIDER))
    }

    async fn exec(&self, handle: &SandboxHandle, command: &str, timeout: Duration) -> Result<RunOutput> {
        let dir = PathBuf::from(&handle.id);
        if !dir.is_dir() {
            return Err(Error::Sandbox(format!("Workspace {} is gone", dir.display())));
        }
        let env = Self::load_env(&dir).await;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&dir)
            .env_clear()
            .env("HOME", &dir)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }

        let start = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| Error::Sandbox(format!("Failed to spawn sh: {}", e)))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(RunOutput::finished(
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
                start.elapsed(),
            )),
            Ok(Err(e)) => Err(Error::Sandbox(format!("Process error: {}", e))),
            Err(_) => {
                warn!("Command in {} timed out after {:?}", handle, timeout);
                Ok(RunOutput::timed_out(
                    String::new(),
                    "Command timed out".to_string(),
                    start.elapsed(),
                ))
            }
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        let dir = PathBuf::from(&handle.id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Workspace {} already removed", dir.display());
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = tokio::fs::remove_file(Self::env_file(&dir)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove env file for {}: {}", dir.display(), e);
            }
        }
        Ok(())
    }

    async fn stats(&self, handle: &SandboxHandle) -> Result<ResourceUsage> {
        let dir = PathBuf::from(&handle.id);
        if !dir.is_dir() {
            return Err(Error::Sandbox(format!("Workspace {} is gone", dir.display())));
        }
        let disk = tokio::task::spawn_blocking(move || disk_usage(&dir))
            .await
            .map_err(|e| Error::Internal(format!("Disk usage task failed: {}", e)))?;

        Ok(ResourceUsage {
            disk_usage_bytes: disk,
            timestamp: Utc::now(),
            ..ResourceUsage::default()
        })
    }

    async fn resolve(&self, session_id: Uuid) -> Result<Option<SandboxHandle>> {
        let dir = self.dir_for(session_id);
        Ok(dir
            .is_dir()
            .then(|| SandboxHandle::new(dir.to_string_lossy(), WORKSPACE_PROVIDER)))
    }
}
