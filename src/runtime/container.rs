//! Docker container-based execution
//!
//! Provides isolated execution in ephemeral containers with network isolation.
//! Containers are removed after every run, including runs whose future is
//! dropped part way; leftovers from crashed workers are swept on connect.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::service::{ContainerSummary, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Backend, Runtime, RuntimeCapabilities};
use crate::config::{ContainerConfig, LanguageImage};
use crate::core::{ExecutionConfig, RunOutput, MAX_TIMEOUT_SECONDS};
use crate::error::{Error, Result};

/// Name prefix of one-shot execution containers
const EXEC_PREFIX: &str = "sandrun-exec-";

/// Running exec containers older than this cannot belong to a live execution
const LEFTOVER_AGE_SECS: i64 = MAX_TIMEOUT_SECONDS as i64 + 5 * 60;

/// Docker container executor
pub struct ContainerRuntime {
    /// Docker client
    docker: Docker,
    /// Container configuration
    config: ContainerConfig,
    /// Images already verified or pulled
    pulled: Mutex<HashSet<String>>,
}

impl ContainerRuntime {
    /// Connect to the local Docker daemon
    pub async fn connect(config: &ContainerConfig) -> Result<Self> {
        let docker = connect_docker().await?;
        info!("Container runtime connected to Docker");

        let removed = remove_leftovers(&docker).await;
        if removed > 0 {
            warn!("Removed {} leftover execution containers", removed);
        }

        Ok(ContainerRuntime {
            docker,
            config: config.clone(),
            pulled: Mutex::new(HashSet::new()),
        })
    }

    fn language(&self, language: &str) -> Result<&LanguageImage> {
        self.config
            .languages
            .get(&language.to_lowercase())
            .ok_or_else(|| Error::UnsupportedLanguage(language.to_string()))
    }

    async fn ensure_image_once(&self, image: &str) -> Result<()> {
        let mut pulled = self.pulled.lock().await;
        if pulled.contains(image) {
            return Ok(());
        }
        ensure_image(&self.docker, image).await?;
        pulled.insert(image.to_string());
        Ok(())
    }

    /// Create and run a container for code execution
    async fn run_container(
        &self,
        language: &str,
        code: &str,
        config: &ExecutionConfig,
    ) -> Result<RunOutput> {
        let spec = self.language(language)?;
        self.ensure_image_once(&spec.image).await?;

        let start = Instant::now();
        let container_name = format!("{}{}", EXEC_PREFIX, uuid::Uuid::new_v4());

        let mut cmd = spec.command.clone();
        cmd.push(code.to_string());

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(cmd),
            env: Some(config.env_pairs()),
            working_dir: Some("/tmp".to_string()),
            network_disabled: Some(config.disable_network),
            host_config: Some(host_config(config, &self.config)),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| Error::Container(format!("Failed to create container: {}", e)))?;

        debug!("Created container: {}", container_name);
        let guard = ContainerGuard::new(self.docker.clone(), container_name.clone());

        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            guard.remove().await?;
            return Err(Error::Container(format!("Failed to start container: {}", e)));
        }

        let wait_result = tokio::time::timeout(
            config.timeout(),
            wait_for_container(&self.docker, &container_name),
        )
        .await;

        let duration = start.elapsed();

        if wait_result.is_err() {
            let kill = KillContainerOptions { signal: "SIGKILL" };
            if let Err(e) = self.docker.kill_container(&container_name, Some(kill)).await {
                debug!("Kill after timeout failed for {}: {}", container_name, e);
            }
        }

        let (stdout, stderr) = collect_logs(&self.docker, &container_name).await;
        guard.remove().await?;

        match wait_result {
            Ok(Ok(exit_code)) => Ok(RunOutput::finished(exit_code, stdout, stderr, duration)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Container execution timed out after {:?}", config.timeout());
                Ok(RunOutput::timed_out(stdout, stderr, duration))
            }
        }
    }
}

/// Removes its container on drop unless `remove` already succeeded, so an
/// execution future dropped mid-run (wrapper timeout, abort) leaves nothing
/// behind.
struct ContainerGuard {
    docker: Docker,
    name: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, name: String) -> Self {
        ContainerGuard {
            docker,
            name,
            armed: true,
        }
    }

    async fn remove(mut self) -> Result<()> {
        remove_container(&self.docker, &self.name).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Container {} left behind: no runtime to remove it", self.name);
            return;
        };

        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        handle.spawn(async move {
            if let Err(e) = remove_container(&docker, &name).await {
                warn!("Deferred removal of {} failed: {}", name, e);
            }
        });
    }
}

/// Whether a listed container is an execution container nobody will remove.
///
/// Stopped ones always qualify; running ones only once they are older than
/// any execution may last.
fn is_leftover(container: &ContainerSummary, now: i64) -> bool {
    let ours = container.names.iter().flatten().any(|name| {
        name.trim_start_matches('/').starts_with(EXEC_PREFIX)
    });
    if !ours {
        return false;
    }

    match container.state.as_deref() {
        Some("running") | Some("restarting") | Some("paused") => container
            .created
            .is_some_and(|created| now - created > LEFTOVER_AGE_SECS),
        _ => true,
    }
}

/// Remove execution containers left by a crashed or aborted worker
async fn remove_leftovers(docker: &Docker) -> usize {
    let options = ListContainersOptions::<String> {
        all: true,
        filters: HashMap::from([("name".to_string(), vec![EXEC_PREFIX.to_string()])]),
        ..Default::default()
    };

    let containers = match docker.list_containers(Some(options)).await {
        Ok(containers) => containers,
        Err(e) => {
            warn!("Could not list leftover containers: {}", e);
            return 0;
        }
    };

    let now = chrono::Utc::now().timestamp();
    let mut removed = 0;
    for container in containers.iter().filter(|c| is_leftover(c, now)) {
        let Some(id) = container.id.as_deref() else {
            continue;
        };
        match remove_container(docker, id).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not remove leftover container {}: {}", id, e),
        }
    }
    removed
}

/// Connect to Docker and verify the daemon answers
pub(crate) async fn connect_docker() -> Result<Docker> {
    let docker = Docker::connect_with_local_defaults()
        .map_err(|e| Error::Container(format!("Failed to connect to Docker: {}", e)))?;

    docker
        .ping()
        .await
        .map_err(|e| Error::Container(format!("Docker ping failed: {}", e)))?;

    Ok(docker)
}

/// Host-level limits derived from an execution config
pub(crate) fn host_config(config: &ExecutionConfig, container: &ContainerConfig) -> HostConfig {
    let network_mode = if config.disable_network {
        "none".to_string()
    } else {
        container.network.clone()
    };

    HostConfig {
        memory: Some(config.memory_limit_bytes() as i64),
        memory_swap: Some(config.memory_limit_bytes() as i64),
        nano_cpus: Some((config.cpu_limit * 1_000_000_000.0) as i64),
        network_mode: Some(network_mode),
        readonly_rootfs: Some(config.read_only_filesystem),
        tmpfs: Some(HashMap::from([(
            "/tmp".to_string(),
            format!("rw,exec,size={}m", container.tmpfs_size_mb),
        )])),
        pids_limit: Some(container.pids_limit),
        auto_remove: Some(false), // We'll remove manually after getting logs
        ..Default::default()
    }
}

/// Ensure a Docker image is available locally, pulling it if needed
pub(crate) async fn ensure_image(docker: &Docker, image: &str) -> Result<()> {
    let images = docker
        .list_images::<String>(None)
        .await
        .map_err(|e| Error::Container(format!("Failed to list images: {}", e)))?;

    let image_exists = images
        .iter()
        .any(|img| img.repo_tags.iter().any(|tag| tag == image || tag.starts_with(&format!("{}:", image))));

    if image_exists {
        return Ok(());
    }

    info!("Pulling Docker image: {}", image);

    let options = CreateImageOptions {
        from_image: image.to_string(),
        ..Default::default()
    };

    let mut stream = docker.create_image(Some(options), None, None);

    while let Some(result) = stream.next().await {
        match result {
            Ok(info) => {
                if let Some(status) = info.status {
                    debug!("Pull status: {}", status);
                }
            }
            Err(e) => {
                return Err(Error::Container(format!("Failed to pull image: {}", e)));
            }
        }
    }

    info!("Image pulled successfully");
    Ok(())
}

/// Wait for a container to finish and return its exit code
async fn wait_for_container(docker: &Docker, name: &str) -> Result<i32> {
    let options = WaitContainerOptions {
        condition: "not-running",
    };

    let mut stream = docker.wait_container(name, Some(options));

    match stream.next().await {
        Some(Ok(response)) => Ok(response.status_code as i32),
        // Non-zero exits surface as an error carrying the code
        Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code as i32),
        Some(Err(e)) => Err(Error::Container(format!("Wait failed: {}", e))),
        None => Err(Error::Container("Container wait stream ended".to_string())),
    }
}

/// Get container logs; read errors are logged and skipped
pub(crate) async fn collect_logs(docker: &Docker, name: &str) -> (String, String) {
    let options = LogsOptions::<String> {
        stdout: true,
        stderr: true,
        ..Default::default()
    };

    let mut stream = docker.logs(name, Some(options));

    let mut stdout = String::new();
    let mut stderr = String::new();

    while let Some(result) = stream.next().await {
        match result {
            Ok(LogOutput::StdOut { message }) => {
                stdout.push_str(&String::from_utf8_lossy(&message));
            }
            Ok(LogOutput::StdErr { message }) => {
                stderr.push_str(&String::from_utf8_lossy(&message));
            }
            Err(e) => {
                warn!("Error reading logs: {}", e);
            }
            _ => {}
        }
    }

    (stdout, stderr)
}

/// Force-remove a container
pub(crate) async fn remove_container(docker: &Docker, name: &str) -> Result<()> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };

    docker
        .remove_container(name, Some(options))
        .await
        .map_err(|e| Error::Container(format!("Failed to remove container: {}", e)))?;

    debug!("Removed container: {}", name);
    Ok(())
}

#[async_trait]
impl Backend for ContainerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    fn supported_environments(&self) -> Vec<String> {
        let mut envs: Vec<String> = self.config.languages.keys().cloned().collect();
        envs.sort();
        envs
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        container_capabilities()
    }
}

pub(crate) fn container_capabilities() -> RuntimeCapabilities {
    RuntimeCapabilities {
        startup_time_ms: 1500,
        memory_overhead_mb: 64,
        isolation_level: 8,
        supports_filesystem_persistence: true,
        supports_network_access: true,
        max_concurrent_executions: 8,
    }
}

#[async_trait]
impl Runtime for ContainerRuntime {
    async fn prepare(&self, language: &str) -> Result<()> {
        let spec = self.language(language)?;
        self.ensure_image_once(&spec.image).await
    }

    async fn execute(&self, language: &str, code: &str, config: &ExecutionConfig) -> Result<RunOutput> {
        self.run_container(language, code, config).await
    }
}
