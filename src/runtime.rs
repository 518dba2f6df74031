//! Container runtime adapter.
//!
//! `ContainerRuntime` is the seam between the deployment pipeline and the
//! engine: production uses the bollard Docker client, tests plug in a fake.
//! All app containers join one shared isolated network, created
//! idempotently at startup, and are addressed by container name on it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{
    ContainerCreateBody, HostConfig, NetworkCreateRequest, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, InspectNetworkOptions,
    LogsOptionsBuilder, RemoveContainerOptionsBuilder, StartContainerOptions,
    StatsOptionsBuilder, StopContainerOptions,
};
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::errors::DeployError;
use crate::logs::LogBroadcaster;

const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything needed to launch one app container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub start_command: String,
    pub port: Option<u16>,
    /// `KEY=value` pairs, already resolved from the vault.
    pub env: Vec<String>,
    pub network: String,
}

impl ContainerSpec {
    /// The address the subdomain router hands to the reverse proxy:
    /// the container's DNS name on the shared network, plus the declared
    /// port when there is one.
    pub fn endpoint(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.name, port),
            None => self.name.clone(),
        }
    }
}

/// An advisory CPU/memory snapshot for a running container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSample {
    pub cpu_pct: f64,
    pub mem_bytes: u64,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// One-shot engine liveness check, called at process start.
    async fn engine_healthy(&self) -> bool;

    /// Create the shared app network if it does not exist. Idempotent.
    async fn ensure_network(&self, name: &str) -> Result<String>;

    /// Create and start a container; returns its engine id. A container
    /// that was created but failed to start is removed before returning.
    async fn run(&self, spec: &ContainerSpec) -> Result<String, DeployError>;

    /// Stop and remove a container. Missing containers are not an error.
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Readiness probe: with a declared port, a TCP connect to the
    /// container on the shared network; without one, a process-alive check.
    async fn probe(&self, container_id: &str, port: Option<u16>) -> Result<bool>;

    /// Follow the container's stdout/stderr into the log broadcaster until
    /// the container exits. Returns immediately; streaming happens in a
    /// background task.
    fn stream_logs(&self, container_id: &str, deployment_id: i64, logs: Arc<LogBroadcaster>);

    /// One advisory resource sample.
    async fn sample_usage(&self, container_id: &str) -> Result<UsageSample>;
}

/// Production adapter over the Docker engine API.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the standard environment (`DOCKER_HOST`, falling back
    /// to the local socket). The connection is lazy; `engine_healthy`
    /// decides whether the engine is actually reachable.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_defaults().context("Failed to build Docker client")?;
        Ok(Self { docker })
    }

    async fn is_running(&self, container_id: &str) -> Result<bool> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;
        Ok(inspect
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn engine_healthy(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn ensure_network(&self, name: &str) -> Result<String> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => return Ok(name.to_string()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(anyhow!(e)).context("Failed to inspect network"),
        }
        self.docker
            .create_network(NetworkCreateRequest {
                name: name.to_string(),
                driver: Some("bridge".to_string()),
                ..Default::default()
            })
            .await
            .context("Failed to create network")?;
        debug!(network = name, "created shared app network");
        Ok(name.to_string())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<String, DeployError> {
        let options = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                spec.start_command.clone(),
            ]),
            env: Some(spec.env.clone()),
            host_config: Some(HostConfig {
                network_mode: Some(spec.network.clone()),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| DeployError::ContainerStart(e.to_string()))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
        {
            // Never leave a half-created container behind.
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptionsBuilder::default().force(true).build()),
                )
                .await;
            return Err(DeployError::ContainerStart(e.to_string()));
        }
        Ok(created.id)
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        if let Err(e) = self
            .docker
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
        {
            match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404 | 304,
                    ..
                } => {}
                other => warn!(container_id, error = %other, "failed to stop container"),
            }
        }
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptionsBuilder::default().force(true).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(anyhow!(e)).context("Failed to remove container"),
        }
    }

    async fn probe(&self, container_id: &str, port: Option<u16>) -> Result<bool> {
        if !self.is_running(container_id).await? {
            return Ok(false);
        }
        let Some(port) = port else {
            return Ok(true);
        };
        // The engine host can reach container IPs on a local bridge network.
        let Some(ip) = self.container_ip_any(container_id).await? else {
            return Ok(false);
        };
        let connect = tokio::net::TcpStream::connect((ip.as_str(), port));
        Ok(tokio::time::timeout(TCP_PROBE_TIMEOUT, connect)
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false))
    }

    fn stream_logs(&self, container_id: &str, deployment_id: i64, logs: Arc<LogBroadcaster>) {
        let docker = self.docker.clone();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            let options = LogsOptionsBuilder::default()
                .follow(true)
                .stdout(true)
                .stderr(true)
                .build();
            let mut stream = docker.logs(&container_id, Some(options));
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(output) => {
                        let text = String::from_utf8_lossy(&output.into_bytes()).into_owned();
                        for line in text.lines() {
                            logs.append(deployment_id, line);
                        }
                    }
                    Err(e) => {
                        debug!(container_id, error = %e, "container log stream ended");
                        break;
                    }
                }
            }
        });
    }

    async fn sample_usage(&self, container_id: &str) -> Result<UsageSample> {
        let options = StatsOptionsBuilder::default().stream(false).build();
        let mut stream = self.docker.stats(container_id, Some(options));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| anyhow!("no stats returned"))?
            .context("Failed to read container stats")?;

        let cpu_pct = (|| {
            let cpu = stats.cpu_stats.as_ref()?;
            let precpu = stats.precpu_stats.as_ref()?;
            let cpu_delta = cpu.cpu_usage.as_ref()?.total_usage?
                .checked_sub(precpu.cpu_usage.as_ref()?.total_usage?)?;
            let system_delta = cpu.system_cpu_usage?.checked_sub(precpu.system_cpu_usage?)?;
            if system_delta == 0 {
                return None;
            }
            let cores = cpu.online_cpus.unwrap_or(1).max(1) as f64;
            Some(cpu_delta as f64 / system_delta as f64 * cores * 100.0)
        })()
        .unwrap_or(0.0);

        let mem_bytes = stats
            .memory_stats
            .and_then(|m| m.usage)
            .unwrap_or(0);

        Ok(UsageSample { cpu_pct, mem_bytes })
    }
}

impl DockerRuntime {
    /// First IP on any attached network; fallback when the shared network
    /// name is not known at the call site.
    async fn container_ip_any(&self, container_id: &str) -> Result<Option<String>> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .context("Failed to inspect container")?;
        Ok(inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .and_then(|nets| {
                nets.into_values()
                    .filter_map(|ep| ep.ip_address)
                    .find(|ip| !ip.is_empty())
            }))
    }
}

/// Stand-in used when no engine connection could be constructed at all;
/// the orchestrator is already degraded, so nothing here should run.
pub struct NullRuntime;

#[async_trait]
impl ContainerRuntime for NullRuntime {
    async fn engine_healthy(&self) -> bool {
        false
    }

    async fn ensure_network(&self, _name: &str) -> Result<String> {
        Err(anyhow!("container runtime unavailable"))
    }

    async fn run(&self, _spec: &ContainerSpec) -> Result<String, DeployError> {
        Err(DeployError::RuntimeUnavailable)
    }

    async fn stop(&self, _container_id: &str) -> Result<()> {
        Err(anyhow!("container runtime unavailable"))
    }

    async fn probe(&self, _container_id: &str, _port: Option<u16>) -> Result<bool> {
        Ok(false)
    }

    fn stream_logs(&self, _container_id: &str, _deployment_id: i64, _logs: Arc<LogBroadcaster>) {}

    async fn sample_usage(&self, _container_id: &str) -> Result<UsageSample> {
        Err(anyhow!("container runtime unavailable"))
    }
}

/// Container name for a deployment: unique per deployment, readable in
/// `docker ps`, and a stable DNS name on the shared network.
pub fn container_name(subdomain: &str, deployment_id: i64) -> String {
    format!("berth-{}-{}", subdomain, deployment_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_includes_port_when_declared() {
        let spec = ContainerSpec {
            image: "berth/demo:abc123".into(),
            name: "berth-demo-4".into(),
            start_command: "run.sh".into(),
            port: Some(8080),
            env: vec![],
            network: "berth-net".into(),
        };
        assert_eq!(spec.endpoint(), "berth-demo-4:8080");
    }

    #[test]
    fn endpoint_without_port_is_bare_name() {
        let spec = ContainerSpec {
            image: "berth/worker:def456".into(),
            name: "berth-worker-9".into(),
            start_command: "worker.sh".into(),
            port: None,
            env: vec![],
            network: "berth-net".into(),
        };
        assert_eq!(spec.endpoint(), "berth-worker-9");
    }

    #[test]
    fn container_names_are_unique_per_deployment() {
        assert_eq!(container_name("demo", 4), "berth-demo-4");
        assert_ne!(container_name("demo", 4), container_name("demo", 5));
    }

    #[tokio::test]
    async fn null_runtime_reports_unhealthy_and_fails_runs() {
        let runtime = NullRuntime;
        assert!(!runtime.engine_healthy().await);
        let spec = ContainerSpec {
            image: "x".into(),
            name: "y".into(),
            start_command: "z".into(),
            port: None,
            env: vec![],
            network: "n".into(),
        };
        assert!(matches!(
            runtime.run(&spec).await,
            Err(DeployError::RuntimeUnavailable)
        ));
    }
}
