//! Docker Compose replica directory using the bollard crate.
//!
//! Replicas are counted from the Docker API by compose labels; scaling
//! shells out to `docker compose ... up -d --scale`, which is the only
//! supported way to change a compose service's replica count.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerSummary;
use bollard::Docker;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::ReplicaDirectory;
use crate::error::DirectoryError;

const SERVICE_LABEL: &str = "com.docker.compose.service";
const PROJECT_LABEL: &str = "com.docker.compose.project";

/// Settings for the compose scale command.
#[derive(Debug, Clone)]
pub struct ComposeConfig {
    /// Compose project name (`-p`).
    pub project: String,
    /// Directory holding the compose file; the command runs there.
    pub working_dir: PathBuf,
    /// Docker CLI binary.
    pub program: String,
    pub timeout: Duration,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            project: "event-driven".to_string(),
            working_dir: PathBuf::from("/workspace"),
            program: "docker".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl ComposeConfig {
    pub fn new(project: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Arguments of the scale command, without the program.
    pub fn scale_args(&self, service: &str, replicas: u32) -> Vec<String> {
        vec![
            "compose".to_string(),
            "-p".to_string(),
            self.project.clone(),
            "up".to_string(),
            "-d".to_string(),
            "--no-recreate".to_string(),
            "--scale".to_string(),
            format!("{}={}", service, replicas),
        ]
    }
}

/// Counts containers that are running and not reported unhealthy.
///
/// Containers without a health check, or whose first check is still
/// pending, count as healthy once running.
pub fn count_healthy(containers: &[ContainerSummary]) -> u32 {
    containers
        .iter()
        .filter(|c| c.state.as_deref() == Some("running"))
        .filter(|c| !c.status.as_deref().is_some_and(|s| s.contains("(unhealthy)")))
        .count() as u32
}

/// Replica directory backed by the local Docker daemon.
pub struct DockerDirectory {
    docker: Docker,
    compose: ComposeConfig,
}

impl DockerDirectory {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryError::DaemonUnavailable` if the daemon socket
    /// cannot be opened.
    pub fn connect(compose: ComposeConfig) -> Result<Self, DirectoryError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DirectoryError::DaemonUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self { docker, compose })
    }

    pub fn from_docker(docker: Docker, compose: ComposeConfig) -> Self {
        Self { docker, compose }
    }

    pub fn compose(&self) -> &ComposeConfig {
        &self.compose
    }

    async fn run_scale(&self, service: &str, replicas: u32) -> Result<(), DirectoryError> {
        let args = self.compose.scale_args(service, replicas);
        debug!(program = %self.compose.program, args = ?args, "Running scale command");

        let child = Command::new(&self.compose.program)
            .args(&args)
            .current_dir(&self.compose.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.compose.timeout, child.wait_with_output())
            .await
            .map_err(|_| DirectoryError::ScaleTimeout {
                service: service.to_string(),
                seconds: self.compose.timeout.as_secs(),
            })??;

        if output.status.success() {
            Ok(())
        } else {
            Err(DirectoryError::ScaleRejected {
                service: service.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ReplicaDirectory for DockerDirectory {
    async fn list_healthy(&self, service: &str) -> Result<u32, DirectoryError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{}={}", SERVICE_LABEL, service),
                format!("{}={}", PROJECT_LABEL, self.compose.project),
            ],
        );
        filters.insert("status".to_string(), vec!["running".to_string()]);

        let options = ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        let healthy = count_healthy(&containers);
        debug!(
            service = service,
            listed = containers.len(),
            healthy = healthy,
            "Listed service replicas"
        );
        Ok(healthy)
    }

    async fn scale_to(&self, service: &str, replicas: u32) -> bool {
        match self.run_scale(service, replicas).await {
            Ok(()) => {
                info!(service = service, replicas = replicas, "Scale command accepted");
                true
            }
            Err(e) => {
                error!(service = service, replicas = replicas, error = %e, "Scale command failed");
                false
            }
        }
    }
}
