//! Docker-backed session sandboxes
//!
//! Each session owns one container started on `sleep infinity`; commands
//! run through `docker exec`. The container name is derived from the
//! session id so a restarted process can find it again.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, StartContainerOptions, StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use chrono::Utc;
use futures::StreamExt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sandbox::{sandbox_name, SandboxHandle, SandboxProvider, SandboxSpec};
use crate::config::ContainerConfig;
use crate::core::RunOutput;
use crate::error::{Error, Result};
use crate::monitor::ResourceUsage;
use crate::runtime::container::{
    connect_docker, container_capabilities, ensure_image, host_config, remove_container,
};
use crate::runtime::{Backend, RuntimeCapabilities};

/// Provider name used in handles and `runtimeType`
pub const DOCKER_PROVIDER: &str = "docker";

/// Long-lived container sandboxes
pub struct DockerSandbox {
    docker: Docker,
    config: ContainerConfig,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon
    pub async fn connect(config: &ContainerConfig) -> Result<Self> {
        let docker = connect_docker().await?;
        Ok(DockerSandbox {
            docker,
            config: config.clone(),
        })
    }

    fn image_for(&self, spec: &SandboxSpec) -> Result<String> {
        match &spec.image {
            Some(image) => Ok(image.clone()),
            None => self
                .config
                .image_for(&spec.language)
                .map(str::to_string)
                .ok_or_else(|| Error::UnsupportedLanguage(spec.language.clone())),
        }
    }

    /// Collect the attached output of an exec
    async fn run_exec(&self, handle: &SandboxHandle, command: &str) -> Result<(i32, String, String)> {
        let exec = self
            .docker
            .create_exec(
                &handle.id,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", command]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some("/workspace"),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Container(format!("Failed to create exec: {}", e)))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match self.docker.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Error reading exec output: {}", e),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(Error::Container("Exec started detached".to_string()));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1) as i32;
        Ok((exit_code, stdout, stderr))
    }
}

fn is_missing(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// CPU percent from a stats sample, relative to one core
fn cpu_percent(stats: &bollard::container::Stats) -> f64 {
    let cpu_delta = stats
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(stats.precpu_stats.cpu_usage.total_usage) as f64;
    let system_delta = stats
        .cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0)) as f64;
    let cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;

    if system_delta <= 0.0 {
        return 0.0;
    }
    cpu_delta / system_delta * cpus * 100.0
}

#[async_trait]
impl Backend for DockerSandbox {
    fn name(&self) -> &str {
        DOCKER_PROVIDER
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

#[async_trait]
impl SandboxProvider for DockerSandbox {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let image = self.image_for(spec)?;
        ensure_image(&self.docker, &image).await?;

        let name = sandbox_name(spec.session_id);
        let mut host = host_config(&spec.limits, &self.config);
        // /workspace is the session's scratch area whether or not it persists
        let mut tmpfs = host.tmpfs.take().unwrap_or_default();
        if !spec.persist_filesystem {
            tmpfs.insert(
                "/workspace".to_string(),
                format!("rw,exec,size={}m", self.config.tmpfs_size_mb),
            );
        }
        host.tmpfs = Some(tmpfs);

        let container_config = Config {
            image: Some(image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(spec.limits.env_pairs()),
            working_dir: Some("/workspace".to_string()),
            network_disabled: Some(spec.limits.disable_network),
            host_config: Some(host),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| Error::Container(format!("Failed to create session container: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = remove_container(&self.docker, &name).await {
                warn!("Cleanup after failed start of {}: {}", name, cleanup);
            }
            return Err(Error::Container(format!("Failed to start session container: {}", e)));
        }

        info!("Session container {} started from {}", name, image);
        debug!("Container id {}", created.id);
        Ok(SandboxHandle::new(name, DOCKER_PROVIDER))
    }

    async fn exec(&self, handle: &SandboxHandle, command: &str, timeout: Duration) -> Result<RunOutput> {
        let start = Instant::now();
        match tokio::time::timeout(timeout, self.run_exec(handle, command)).await {
            Ok(Ok((exit_code, stdout, stderr))) => {
                Ok(RunOutput::finished(exit_code, stdout, stderr, start.elapsed()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("Command in {} timed out after {:?}", handle, timeout);
                // kill -1 spares PID 1, so the keep-alive process survives
                if let Err(e) = self.run_exec(handle, "kill -9 -1").await {
                    debug!("Post-timeout kill in {} failed: {}", handle, e);
                }
                Ok(RunOutput::timed_out(
                    String::new(),
                    "Command timed out".to_string(),
                    start.elapsed(),
                ))
            }
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        match remove_container(&self.docker, &handle.id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Already gone is the desired end state
                let gone = self.docker.inspect_container(&handle.id, None).await;
                match gone {
                    Err(inspect) if is_missing(&inspect) => Ok(()),
                    _ => Err(e),
                }
            }
        }
    }

    async fn stats(&self, handle: &SandboxHandle) -> Result<ResourceUsage> {
        let mut stream = self.docker.stats(
            &handle.id,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(Error::Container(format!("No stats for {}", handle))),
        };

        let inspect = self
            .docker
            .inspect_container(&handle.id, Some(InspectContainerOptions { size: true }))
            .await?;

        let (rx, tx) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(ResourceUsage {
            memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
            cpu_usage_percent: cpu_percent(&stats),
            disk_usage_bytes: inspect.size_rw.unwrap_or(0).max(0) as u64,
            process_count: stats.pids_stats.current.unwrap_or(0),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            timestamp: Utc::now(),
        })
    }

    async fn resolve(&self, session_id: Uuid) -> Result<Option<SandboxHandle>> {
        let name = sandbox_name(session_id);
        match self.docker.inspect_container(&name, None).await {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(running.then(|| SandboxHandle::new(name, DOCKER_PROVIDER)))
            }
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
