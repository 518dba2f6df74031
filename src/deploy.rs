//! The deployment orchestrator: admission control, the per-deployment
//! pipeline task, supersession, cancellation, and crash recovery.
//!
//! Each deployment runs as one long-lived tokio task that suspends at I/O
//! boundaries, so pipelines for distinct projects proceed in parallel. The
//! per-project lock is held only across admission (active-check + QUEUED
//! insert), never for the build/deploy duration.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::build::ImageBuilder;
use crate::config::Config;
use crate::db::{DbHandle, TransitionFields};
use crate::errors::DeployError;
use crate::logs::LogBroadcaster;
use crate::models::{Deployment, DeploymentStatus, Project};
use crate::registry::Registry;
use crate::router::SubdomainRouter;
use crate::runtime::{ContainerRuntime, ContainerSpec, container_name};

/// Lines of log tail attached to failed deployment records.
const LOG_TAIL_LINES: usize = 50;
/// How long after HEALTHY the advisory usage sample is taken.
const USAGE_SAMPLE_DELAY: Duration = Duration::from_secs(2);

pub struct Orchestrator {
    db: DbHandle,
    registry: Arc<Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    builder: Arc<dyn ImageBuilder>,
    router: Arc<SubdomainRouter>,
    logs: Arc<LogBroadcaster>,
    config: Config,
    vault_present: bool,
    /// Admission locks keyed by project id; held only during transition
    /// validation, never across a build.
    project_locks: DashMap<i64, Arc<tokio::sync::Mutex<()>>>,
    /// In-flight pipeline tasks keyed by deployment id, so they can be
    /// cancelled and drained on shutdown.
    active: tokio::sync::Mutex<HashMap<i64, JoinHandle<()>>>,
    deploys_enabled: AtomicBool,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DbHandle,
        registry: Arc<Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        builder: Arc<dyn ImageBuilder>,
        router: Arc<SubdomainRouter>,
        logs: Arc<LogBroadcaster>,
        config: Config,
        vault_present: bool,
    ) -> Self {
        Self {
            db,
            registry,
            runtime,
            builder,
            router,
            logs,
            config,
            vault_present,
            project_locks: DashMap::new(),
            active: tokio::sync::Mutex::new(HashMap::new()),
            deploys_enabled: AtomicBool::new(false),
        }
    }

    pub fn deploys_enabled(&self) -> bool {
        self.deploys_enabled.load(Ordering::Relaxed)
    }

    /// Probe the engine, create the shared network, and recover persisted
    /// state: interrupted pipelines become FAILED and routes are rebuilt
    /// from the HEALTHY deployments. Called once at process start.
    pub async fn startup(&self) -> Result<()> {
        let engine_ok = self.runtime.engine_healthy().await;
        if engine_ok {
            self.runtime.ensure_network(&self.config.network_name).await?;
        } else {
            warn!("container engine unreachable; starting in read-only degraded mode");
        }
        if !self.vault_present {
            warn!("vault secret not configured; deploys are disabled");
        }
        self.deploys_enabled
            .store(engine_ok && self.vault_present, Ordering::Relaxed);

        let interrupted = self
            .db
            .call(|s| s.fail_interrupted_deployments("orchestrator restarted"))
            .await?;
        if interrupted > 0 {
            warn!(count = interrupted, "marked interrupted deployments as failed");
        }

        let healthy = self.db.call(|s| s.list_healthy_deployments()).await?;
        for dep in healthy {
            let Ok(project) = self.registry.get(dep.project_id).await else {
                continue;
            };
            let Some(endpoint) = dep.endpoint.clone() else {
                continue;
            };
            if engine_ok {
                let running = match &dep.container_id {
                    Some(cid) => self.runtime.probe(cid, None).await.unwrap_or(false),
                    None => false,
                };
                if !running {
                    info!(
                        deployment_id = dep.id,
                        subdomain = %project.subdomain,
                        "healthy deployment's container is gone; marking stopped"
                    );
                    let _ = self
                        .transition(dep.id, DeploymentStatus::Stopped, TransitionFields::default())
                        .await;
                    continue;
                }
            }
            self.router.register(&project.subdomain, &endpoint, dep.id);
        }
        info!(routes = self.router.len(), "route table rebuilt");
        Ok(())
    }

    /// Accept a deploy request: admit it under the per-project lock, create
    /// the QUEUED record, and spawn the pipeline task. Exactly one of two
    /// concurrent requests for the same project wins admission.
    pub async fn deploy(self: &Arc<Self>, project: Project) -> Result<Deployment, DeployError> {
        if !self.deploys_enabled() {
            return Err(DeployError::RuntimeUnavailable);
        }
        let lock = self
            .project_locks
            .entry(project.id)
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let project_id = project.id;
        let deployment = self
            .db
            .call(move |s| {
                if s.find_active_deployment(project_id)?.is_some() {
                    return Ok(Err(DeployError::DeploymentInProgress { project_id }));
                }
                Ok(s.create_deployment(project_id).map_err(DeployError::Other))
            })
            .await
            .map_err(DeployError::Other)??;

        info!(
            deployment_id = deployment.id,
            project_id,
            subdomain = %project.subdomain,
            "deployment admitted"
        );
        let orch = Arc::clone(self);
        let deployment_id = deployment.id;
        // The map lock is held across the spawn so the pipeline's own
        // cleanup cannot observe the map before its handle is inserted.
        let mut active = self.active.lock().await;
        let task = tokio::spawn(async move {
            orch.run_pipeline(project, deployment_id).await;
        });
        active.insert(deployment_id, task);
        Ok(deployment)
    }

    /// Stop the project's active deployment. A HEALTHY deployment is torn
    /// down and marked STOPPED; an in-flight pipeline is cancelled (its
    /// build process and any started container are terminated) and marked
    /// FAILED.
    pub async fn stop(self: &Arc<Self>, project: &Project) -> Result<Deployment, DeployError> {
        let lock = self
            .project_locks
            .entry(project.id)
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        let project_id = project.id;
        let (healthy, active) = self
            .db
            .call(move |s| {
                Ok((
                    s.find_healthy_deployment(project_id)?,
                    s.find_active_deployment(project_id)?,
                ))
            })
            .await
            .map_err(DeployError::Other)?;

        if let Some(dep) = healthy {
            if let Some(ref cid) = dep.container_id {
                self.runtime.stop(cid).await.map_err(DeployError::Other)?;
            }
            let updated = self
                .transition(dep.id, DeploymentStatus::Stopped, TransitionFields::default())
                .await?;
            self.router.unregister_deployment(&project.subdomain, dep.id);
            self.logs.append(dep.id, "==> deployment stopped by operator");
            self.logs.close(dep.id);
            info!(deployment_id = dep.id, project_id, "deployment stopped");
            return Ok(updated);
        }

        if let Some(dep) = active {
            // Abort the pipeline task first so it cannot race the failure
            // transition; kill_on_drop reaps any running build child. The
            // handle is taken out before awaiting so the map lock is not
            // held while the task winds down.
            let task = self.active.lock().await.remove(&dep.id);
            if let Some(task) = task {
                task.abort();
                let _ = task.await;
            }
            if let Ok(Some(current)) = self.db.call(move |s| s.get_deployment(dep.id)).await
                && let Some(ref cid) = current.container_id
            {
                let _ = self.runtime.stop(cid).await;
            }
            // The abort can land between the engine starting the container
            // and the record catching up, so also tear down by the
            // deterministic name the pipeline would have used.
            let _ = self
                .runtime
                .stop(&container_name(&project.subdomain, dep.id))
                .await;
            self.logs.append(dep.id, "==> deployment cancelled by operator");
            let tail = self.logs.tail(dep.id, LOG_TAIL_LINES);
            let updated = self
                .transition(
                    dep.id,
                    DeploymentStatus::Failed,
                    TransitionFields {
                        error: Some(DeployError::Cancelled.to_string()),
                        log_tail: Some(tail),
                        ..Default::default()
                    },
                )
                .await?;
            self.router.unregister_deployment(&project.subdomain, dep.id);
            self.logs.close(dep.id);
            info!(deployment_id = dep.id, project_id, "in-flight deployment cancelled");
            return Ok(updated);
        }

        Err(DeployError::NothingToStop)
    }

    /// Drain in-flight pipelines on process shutdown. Healthy containers
    /// are left running; recovery re-registers them on next start.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        for (deployment_id, task) in active.drain() {
            warn!(deployment_id, "aborting in-flight pipeline on shutdown");
            task.abort();
        }
    }

    async fn run_pipeline(self: Arc<Self>, project: Project, deployment_id: i64) {
        let result = self.execute_stages(&project, deployment_id).await;
        if let Err(err) = result {
            self.fail_deployment(&project, deployment_id, err).await;
        }
        self.active.lock().await.remove(&deployment_id);
    }

    async fn execute_stages(
        self: &Arc<Self>,
        project: &Project,
        deployment_id: i64,
    ) -> Result<(), DeployError> {
        self.transition(deployment_id, DeploymentStatus::Building, TransitionFields::default())
            .await?;
        self.logs.append(
            deployment_id,
            format!(
                "==> deploying project '{}' ({} @ {})",
                project.name, project.repo_url, project.branch
            ),
        );

        let env = self.registry.resolve_env_vars(project.id).await?;
        let image = self
            .builder
            .build(project, &env, deployment_id, &self.logs)
            .await?;

        self.transition(
            deployment_id,
            DeploymentStatus::Deploying,
            TransitionFields {
                image_ref: Some(image.clone()),
                ..Default::default()
            },
        )
        .await?;

        let spec = ContainerSpec {
            image,
            name: container_name(&project.subdomain, deployment_id),
            start_command: project.start_command.clone(),
            port: project.port,
            env: env.to_env_strings(),
            network: self.config.network_name.clone(),
        };
        let container_id = self.runtime.run(&spec).await?;
        let endpoint = spec.endpoint();
        // Persist the container handle immediately: cancellation and crash
        // recovery clean up from the record, not from task-local state.
        {
            let (cid, ep) = (container_id.clone(), endpoint.clone());
            self.db
                .call(move |s| s.attach_container(deployment_id, &cid, &ep))
                .await
                .map_err(DeployError::Other)?;
        }
        self.runtime
            .stream_logs(&container_id, deployment_id, Arc::clone(&self.logs));

        if !self.await_readiness(&container_id, project.port).await? {
            return Err(DeployError::ProbeTimeout(self.config.probe_grace_secs));
        }

        // The predecessor is looked up before this deployment turns
        // HEALTHY, so supersession sees exactly the record it replaces.
        let project_id = project.id;
        let predecessor = self
            .db
            .call(move |s| s.find_healthy_deployment(project_id))
            .await
            .map_err(DeployError::Other)?;

        // Install the route before the HEALTHY transition so every observer
        // of a HEALTHY record can already resolve it; the overwrite is a
        // single atomic map write, so the subdomain never goes unrouted
        // during the swap. Failure paths unregister by deployment id.
        self.router
            .register(&project.subdomain, &endpoint, deployment_id);
        self.transition(
            deployment_id,
            DeploymentStatus::Healthy,
            TransitionFields {
                container_id: Some(container_id.clone()),
                endpoint: Some(endpoint.clone()),
                ..Default::default()
            },
        )
        .await?;
        self.logs.append(
            deployment_id,
            format!("==> healthy; routing {} -> {}", project.subdomain, endpoint),
        );
        info!(deployment_id, subdomain = %project.subdomain, %endpoint, "deployment healthy");

        if let Some(old) = predecessor
            && old.id != deployment_id
        {
            if let Some(ref cid) = old.container_id {
                if let Err(e) = self.runtime.stop(cid).await {
                    warn!(deployment_id = old.id, error = %e, "failed to stop superseded container");
                }
            }
            let _ = self
                .transition(old.id, DeploymentStatus::Stopped, TransitionFields::default())
                .await;
            self.logs.append(old.id, "==> superseded by a newer deployment");
            self.logs.close(old.id);
            info!(superseded = old.id, by = deployment_id, "deployment superseded");
        }

        self.spawn_usage_sampler(deployment_id, container_id);
        Ok(())
    }

    /// Poll the readiness probe until it passes or the grace period ends.
    async fn await_readiness(
        &self,
        container_id: &str,
        port: Option<u16>,
    ) -> Result<bool, DeployError> {
        let deadline = Instant::now() + self.config.probe_grace();
        loop {
            match self.runtime.probe(container_id, port).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => warn!(container_id, error = %e, "readiness probe errored"),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.config.probe_interval()).await;
        }
    }

    /// Unified failure path: tear down any started container, drop any
    /// route this deployment installed, attach the reason and log tail,
    /// mark FAILED, and end the log stream.
    async fn fail_deployment(&self, project: &Project, deployment_id: i64, err: DeployError) {
        let reason = err.to_string();
        error!(deployment_id, %reason, "deployment failed");
        self.router
            .unregister_deployment(&project.subdomain, deployment_id);
        self.logs
            .append(deployment_id, format!("==> deployment failed: {}", reason));

        if let Ok(Some(dep)) = self.db.call(move |s| s.get_deployment(deployment_id)).await
            && let Some(ref cid) = dep.container_id
        {
            if let Err(e) = self.runtime.stop(cid).await {
                warn!(container_id = %cid, error = %e, "cleanup of failed deployment's container failed");
            }
        }

        let tail = self.logs.tail(deployment_id, LOG_TAIL_LINES);
        // An already-terminal record (e.g. cancelled concurrently) is fine.
        let _ = self
            .transition(
                deployment_id,
                DeploymentStatus::Failed,
                TransitionFields {
                    error: Some(reason),
                    log_tail: Some(tail),
                    ..Default::default()
                },
            )
            .await;
        self.logs.close(deployment_id);
    }

    fn spawn_usage_sampler(self: &Arc<Self>, deployment_id: i64, container_id: String) {
        let orch = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(USAGE_SAMPLE_DELAY).await;
            match orch.runtime.sample_usage(&container_id).await {
                Ok(sample) => {
                    let _ = orch
                        .db
                        .call(move |s| {
                            s.record_usage(deployment_id, sample.cpu_pct, sample.mem_bytes as i64)
                        })
                        .await;
                }
                Err(e) => {
                    // Advisory only.
                    tracing::debug!(deployment_id, error = %e, "usage sample failed");
                }
            }
        });
    }

    async fn transition(
        &self,
        deployment_id: i64,
        to: DeploymentStatus,
        fields: TransitionFields,
    ) -> Result<Deployment, DeployError> {
        self.db
            .call(move |s| Ok(s.transition_deployment(deployment_id, to, fields)))
            .await
            .map_err(DeployError::Other)?
    }
}
