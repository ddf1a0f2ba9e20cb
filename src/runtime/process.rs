//! Native process execution
//!
//! Runs code through a locally installed interpreter (deno, bun, python,
//! node, sh) in a throwaway working directory with a scrubbed environment.
//! Weakest isolation of the shipped backends, but the fastest to start.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{Backend, Runtime, RuntimeCapabilities};
use crate::core::{ExecutionConfig, RunOutput};
use crate::error::{Error, Result};

/// Native interpreter runtime
pub struct ProcessRuntime {
    name: String,
    program: String,
    default_args: Vec<String>,
    language_args: HashMap<String, Vec<String>>,
    environments: Vec<String>,
    capabilities: RuntimeCapabilities,
    scratch_root: PathBuf,
}

impl ProcessRuntime {
    /// Create a runtime that invokes `program <args...> <code>`
    pub fn new(
        name: impl Into<String>,
        program: impl Into<String>,
        args: &[&str],
        environments: &[&str],
        capabilities: RuntimeCapabilities,
    ) -> Self {
        ProcessRuntime {
            name: name.into(),
            program: program.into(),
            default_args: args.iter().map(|s| s.to_string()).collect(),
            language_args: HashMap::new(),
            environments: environments.iter().map(|s| s.to_string()).collect(),
            capabilities,
            scratch_root: std::env::temp_dir(),
        }
    }

    /// Use different arguments for one language
    pub fn with_language_args(mut self, language: &str, args: &[&str]) -> Self {
        self.language_args.insert(
            language.to_lowercase(),
            args.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    /// Directory under which per-execution scratch dirs are created
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn deno() -> Self {
        ProcessRuntime::new(
            "deno",
            "deno",
            &["eval"],
            &["deno", "javascript", "typescript"],
            native_capabilities(50, 40, 4),
        )
        .with_language_args("typescript", &["eval", "--ext=ts"])
    }

    pub fn bun() -> Self {
        ProcessRuntime::new(
            "bun",
            "bun",
            &["-e"],
            &["bun", "javascript", "typescript"],
            native_capabilities(20, 30, 2),
        )
    }

    pub fn python() -> Self {
        ProcessRuntime::new(
            "python",
            "python3",
            &["-c"],
            &["python", "python3"],
            native_capabilities(40, 15, 1),
        )
    }

    pub fn node() -> Self {
        ProcessRuntime::new(
            "node",
            "node",
            &["-e"],
            &["node", "javascript"],
            native_capabilities(60, 40, 1),
        )
    }

    pub fn shell() -> Self {
        ProcessRuntime::new(
            "shell",
            "sh",
            &["-c"],
            &["shell", "bash", "sh"],
            native_capabilities(5, 2, 1),
        )
    }

    fn args_for(&self, language: &str) -> &[String] {
        self.language_args
            .get(&language.to_lowercase())
            .unwrap_or(&self.default_args)
    }
}

fn native_capabilities(startup_ms: u64, memory_mb: u64, isolation: u32) -> RuntimeCapabilities {
    RuntimeCapabilities {
        startup_time_ms: startup_ms,
        memory_overhead_mb: memory_mb,
        isolation_level: isolation,
        supports_filesystem_persistence: false,
        supports_network_access: true,
        max_concurrent_executions: 16,
    }
}

#[async_trait]
impl Backend for ProcessRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_environments(&self) -> Vec<String> {
        self.environments.clone()
    }

    async fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        self.capabilities.clone()
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    async fn execute(&self, language: &str, code: &str, config: &ExecutionConfig) -> Result<RunOutput> {
        let scratch = self
            .scratch_root
            .join(format!("sandrun-exec-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;

        debug!(
            "Executing {} code with {} (scratch: {})",
            language,
            self.program,
            scratch.display()
        );

        let mut command = Command::new(&self.program);
        command
            .args(self.args_for(language))
            .arg(code)
            .current_dir(&scratch)
            .env_clear()
            .env("HOME", &scratch)
            .envs(&config.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }

        let start = Instant::now();
        let child = command.spawn().map_err(|e| {
            Error::Sandbox(format!("Failed to spawn {}: {}", self.program, e))
        });
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&scratch).await;
                return Err(e);
            }
        };

        // Dropping the wait future on timeout kills the child (kill_on_drop).
        let result = tokio::time::timeout(config.timeout(), child.wait_with_output()).await;
        let duration = start.elapsed();

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!("Failed to remove scratch dir {}: {}", scratch.display(), e);
        }

        match result {
            Ok(Ok(output)) => Ok(RunOutput::finished(
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).to_string(),
                String::from_utf8_lossy(&output.stderr).to_string(),
                duration,
            )),
            Ok(Err(e)) => Err(Error::Sandbox(format!("Process error: {}", e))),
            Err(_) => {
                warn!("Execution timed out after {:?}", config.timeout());
                Ok(RunOutput::timed_out(
                    String::new(),
                    "Execution timed out".to_string(),
                    duration,
                ))
            }
        }
    }
}
