//! Build pipeline: fetch source at the declared branch, run the project's
//! build command, and bake the tree into a runnable image.
//!
//! Every stdout/stderr line of every stage is forwarded to the log
//! broadcaster as it is produced. One wall-clock deadline covers the whole
//! pipeline; children are killed on expiry and the scratch directory is
//! removed on every exit path via tempdir RAII.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::Instant;

use crate::errors::DeployError;
use crate::logs::LogBroadcaster;
use crate::models::Project;
use crate::registry::ResolvedEnv;

/// Seam between the orchestrator and the build toolchain; tests substitute
/// a fake that produces tags without touching git or the engine.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Produce a runnable image for the project's current source and
    /// return its unique tag.
    async fn build(
        &self,
        project: &Project,
        env: &ResolvedEnv,
        deployment_id: i64,
        logs: &Arc<LogBroadcaster>,
    ) -> Result<String, DeployError>;
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Fetch,
    Build,
    Bake,
}

impl Stage {
    fn failure(self, detail: String) -> DeployError {
        match self {
            Stage::Fetch => DeployError::FetchFailed(detail),
            Stage::Build => DeployError::BuildFailed(detail),
            Stage::Bake => DeployError::BuildFailed(detail),
        }
    }
}

/// Production builder: shells out to `git` and `docker build`, the same
/// toolchain an operator would drive by hand.
pub struct ShellBuilder {
    timeout: Duration,
}

impl ShellBuilder {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run_streamed(
        &self,
        mut cmd: Command,
        stage: Stage,
        deployment_id: i64,
        logs: &Arc<LogBroadcaster>,
        deadline: Instant,
    ) -> Result<(), DeployError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| stage.failure(format!("failed to spawn: {}", e)))?;

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;
        let out_task = spawn_line_reader(stdout, deployment_id, Arc::clone(logs));
        let err_task = spawn_line_reader(stderr, deployment_id, Arc::clone(logs));

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Err(_) => {
                let _ = child.kill().await;
                out_task.abort();
                err_task.abort();
                return Err(DeployError::BuildTimeout(self.timeout.as_secs()));
            }
            Ok(result) => result.map_err(|e| stage.failure(format!("wait failed: {}", e)))?,
        };
        // Flush whatever the readers still hold before judging the exit.
        let _ = out_task.await;
        let _ = err_task.await;

        if !status.success() {
            return Err(stage.failure(format!(
                "exited with {}",
                status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for ShellBuilder {
    async fn build(
        &self,
        project: &Project,
        env: &ResolvedEnv,
        deployment_id: i64,
        logs: &Arc<LogBroadcaster>,
    ) -> Result<String, DeployError> {
        let tag = image_tag(&project.subdomain);
        let deadline = Instant::now() + self.timeout;
        let scratch = tempfile::tempdir()
            .context("Failed to create build scratch directory")
            .map_err(DeployError::Other)?;
        let src = scratch.path().join("src");
        let src_str = src.to_string_lossy().to_string();

        logs.append(
            deployment_id,
            format!("==> fetching {} @ {}", project.repo_url, project.branch),
        );
        let mut fetch = Command::new("git");
        fetch.args([
            "clone",
            "--depth",
            "1",
            "--single-branch",
            "--branch",
            &project.branch,
            &project.repo_url,
            &src_str,
        ]);
        self.run_streamed(fetch, Stage::Fetch, deployment_id, logs, deadline)
            .await?;

        if !project.build_command.trim().is_empty() {
            logs.append(deployment_id, format!("==> running {}", project.build_command));
            let mut build = Command::new("sh");
            build
                .args(["-c", &project.build_command])
                .current_dir(&src)
                .envs(env.to_env_strings().iter().filter_map(|kv| {
                    kv.split_once('=')
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                }));
            self.run_streamed(build, Stage::Build, deployment_id, logs, deadline)
                .await?;
        }

        if !src.join("Dockerfile").exists() {
            tokio::fs::write(src.join("Dockerfile"), default_dockerfile(project.port))
                .await
                .context("Failed to write default Dockerfile")
                .map_err(DeployError::Other)?;
            logs.append(deployment_id, "==> no Dockerfile found, using default");
        }

        logs.append(deployment_id, format!("==> baking image {}", tag));
        let mut bake = Command::new("docker");
        bake.args(["build", "-t", &tag, &src_str]);
        self.run_streamed(bake, Stage::Bake, deployment_id, logs, deadline)
            .await?;

        logs.append(deployment_id, format!("==> image {} ready", tag));
        Ok(tag)
    }
}

fn spawn_line_reader(
    reader: impl AsyncRead + Unpin + Send + 'static,
    deployment_id: i64,
    logs: Arc<LogBroadcaster>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.append(deployment_id, line);
        }
    })
}

/// A fresh tag per build, so successive builds for the same project never
/// collide and a superseded deployment's image stays addressable.
pub fn image_tag(subdomain: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("berth/{}:{}", subdomain, &id[..12])
}

fn default_dockerfile(port: Option<u16>) -> String {
    let expose = port
        .map(|p| format!("EXPOSE {}\n", p))
        .unwrap_or_default();
    format!(
        "FROM debian:bookworm-slim\nWORKDIR /app\nCOPY . .\n{}",
        expose
    )
}
