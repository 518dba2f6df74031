use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::DeployError;
use crate::models::{Deployment, DeploymentStatus, EnvVar, Project};

/// Async-safe handle to the berth store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. Serializing through one
/// connection also makes every closure an atomic check-and-set, which the
/// deployment transition logic relies on.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("store task panicked")?
    }
}

pub struct Store {
    conn: Connection,
}

/// Fields attached to a deployment as part of a status transition. Only
/// `Some` fields are written.
#[derive(Debug, Default, Clone)]
pub struct TransitionFields {
    pub image_ref: Option<String>,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    pub error: Option<String>,
    pub log_tail: Option<String>,
}

/// Partial update for a project; `None` leaves the column untouched.
/// Doubles as the PATCH request body.
#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub port: Option<u16>,
    pub subdomain: Option<String>,
}

impl Store {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    repo_url TEXT NOT NULL,
                    branch TEXT NOT NULL DEFAULT 'main',
                    build_command TEXT NOT NULL,
                    start_command TEXT NOT NULL,
                    port INTEGER,
                    subdomain TEXT NOT NULL UNIQUE,
                    owner_id TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS env_vars (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    key TEXT NOT NULL,
                    ciphertext TEXT NOT NULL,
                    UNIQUE(project_id, key)
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'queued',
                    image_ref TEXT,
                    container_id TEXT,
                    endpoint TEXT,
                    error TEXT,
                    log_tail TEXT,
                    cpu_pct REAL,
                    mem_bytes INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_env_vars_project ON env_vars(project_id);
                CREATE INDEX IF NOT EXISTS idx_deployments_project ON deployments(project_id);
                CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments(project_id, status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    /// Insert a project and its initial env vars in one transaction.
    /// Either the project row and every env var land together, or nothing
    /// is persisted.
    pub fn create_project_with_env(
        &self,
        name: &str,
        repo_url: &str,
        branch: &str,
        build_command: &str,
        start_command: &str,
        port: Option<u16>,
        subdomain: &str,
        owner_id: &str,
        env_vars: &[(String, String)],
    ) -> Result<Project> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO projects (name, repo_url, branch, build_command, start_command, port, subdomain, owner_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                name,
                repo_url,
                branch,
                build_command,
                start_command,
                port.map(i64::from),
                subdomain,
                owner_id
            ],
        )
        .context("Failed to insert project")?;
        let id = tx.last_insert_rowid();
        for (key, ciphertext) in env_vars {
            tx.execute(
                "INSERT INTO env_vars (project_id, key, ciphertext) VALUES (?1, ?2, ?3)",
                params![id, key, ciphertext],
            )
            .with_context(|| format!("Failed to insert env var '{}'", key))?;
        }
        tx.commit().context("Failed to commit project create")?;
        self.get_project(id)?
            .context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_PROJECT),
                params![id],
                row_to_project,
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn subdomain_taken(&self, subdomain: &str, exclude_project: Option<i64>) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM projects WHERE subdomain = ?1 AND id != ?2",
                params![subdomain, exclude_project.unwrap_or(-1)],
                |row| row.get(0),
            )
            .context("Failed to check subdomain")?;
        Ok(count > 0)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY id", SELECT_PROJECT))
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], row_to_project)
            .context("Failed to query projects")?;
        collect_rows(rows)
    }

    pub fn list_projects_by_owner(&self, owner_id: &str) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE owner_id = ?1 ORDER BY id", SELECT_PROJECT))
            .context("Failed to prepare list_projects_by_owner")?;
        let rows = stmt
            .query_map(params![owner_id], row_to_project)
            .context("Failed to query projects by owner")?;
        collect_rows(rows)
    }

    pub fn update_project(&self, id: i64, patch: &ProjectPatch) -> Result<Option<Project>> {
        let Some(current) = self.get_project(id)? else {
            return Ok(None);
        };
        self.conn
            .execute(
                "UPDATE projects SET name = ?1, repo_url = ?2, branch = ?3, build_command = ?4,
                 start_command = ?5, port = ?6, subdomain = ?7, updated_at = datetime('now')
                 WHERE id = ?8",
                params![
                    patch.name.as_deref().unwrap_or(&current.name),
                    patch.repo_url.as_deref().unwrap_or(&current.repo_url),
                    patch.branch.as_deref().unwrap_or(&current.branch),
                    patch.build_command.as_deref().unwrap_or(&current.build_command),
                    patch.start_command.as_deref().unwrap_or(&current.start_command),
                    patch.port.or(current.port).map(i64::from),
                    patch.subdomain.as_deref().unwrap_or(&current.subdomain),
                    id
                ],
            )
            .context("Failed to update project")?;
        self.get_project(id)
    }

    /// Deletion cascades to env vars and deployment history via FKs.
    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(affected > 0)
    }

    // ── Env vars ──────────────────────────────────────────────────────

    pub fn list_env_vars(&self, project_id: i64) -> Result<Vec<EnvVar>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, project_id, key, ciphertext FROM env_vars WHERE project_id = ?1 ORDER BY key")
            .context("Failed to prepare list_env_vars")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(EnvVar {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    key: row.get(2)?,
                    ciphertext: row.get(3)?,
                })
            })
            .context("Failed to query env vars")?;
        collect_rows(rows)
    }

    pub fn upsert_env_var(&self, project_id: i64, key: &str, ciphertext: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO env_vars (project_id, key, ciphertext) VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_id, key) DO UPDATE SET ciphertext = excluded.ciphertext",
                params![project_id, key, ciphertext],
            )
            .context("Failed to upsert env var")?;
        Ok(())
    }

    pub fn delete_env_var(&self, project_id: i64, key: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM env_vars WHERE project_id = ?1 AND key = ?2",
                params![project_id, key],
            )
            .context("Failed to delete env var")?;
        Ok(affected > 0)
    }

    // ── Deployments ───────────────────────────────────────────────────

    pub fn create_deployment(&self, project_id: i64) -> Result<Deployment> {
        self.conn
            .execute(
                "INSERT INTO deployments (project_id, status) VALUES (?1, 'queued')",
                params![project_id],
            )
            .context("Failed to insert deployment")?;
        let id = self.conn.last_insert_rowid();
        self.get_deployment(id)?
            .context("Deployment not found after insert")
    }

    /// Record the started container as soon as the engine hands it back, so
    /// cancellation and crash recovery can always find it for cleanup.
    pub fn attach_container(&self, id: i64, container_id: &str, endpoint: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE deployments SET container_id = ?1, endpoint = ?2, updated_at = datetime('now')
                 WHERE id = ?3",
                params![container_id, endpoint, id],
            )
            .context("Failed to attach container to deployment")?;
        Ok(())
    }

    pub fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_DEPLOYMENT),
                params![id],
                row_to_deployment,
            )
            .optional()
            .context("Failed to query deployment")
    }

    pub fn list_deployments(&self, project_id: i64) -> Result<Vec<Deployment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE project_id = ?1 ORDER BY id DESC",
                SELECT_DEPLOYMENT
            ))
            .context("Failed to prepare list_deployments")?;
        let rows = stmt
            .query_map(params![project_id], row_to_deployment)
            .context("Failed to query deployments")?;
        collect_rows(rows)
    }

    /// The deployment currently holding the project's in-flight pipeline
    /// slot (queued/building/deploying), if any.
    pub fn find_active_deployment(&self, project_id: i64) -> Result<Option<Deployment>> {
        self.conn
            .query_row(
                &format!(
                    "{} WHERE project_id = ?1 AND status IN ('queued','building','deploying')
                     ORDER BY id DESC LIMIT 1",
                    SELECT_DEPLOYMENT
                ),
                params![project_id],
                row_to_deployment,
            )
            .optional()
            .context("Failed to query active deployment")
    }

    pub fn find_healthy_deployment(&self, project_id: i64) -> Result<Option<Deployment>> {
        self.conn
            .query_row(
                &format!(
                    "{} WHERE project_id = ?1 AND status = 'healthy' ORDER BY id DESC LIMIT 1",
                    SELECT_DEPLOYMENT
                ),
                params![project_id],
                row_to_deployment,
            )
            .optional()
            .context("Failed to query healthy deployment")
    }

    pub fn list_healthy_deployments(&self) -> Result<Vec<Deployment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE status = 'healthy' ORDER BY id",
                SELECT_DEPLOYMENT
            ))
            .context("Failed to prepare list_healthy_deployments")?;
        let rows = stmt
            .query_map([], row_to_deployment)
            .context("Failed to query healthy deployments")?;
        collect_rows(rows)
    }

    /// Atomically validate and apply a status transition. The read and the
    /// write happen under the store lock, so concurrent transitions on the
    /// same deployment serialize here.
    pub fn transition_deployment(
        &self,
        id: i64,
        to: DeploymentStatus,
        fields: TransitionFields,
    ) -> Result<Deployment, DeployError> {
        let current = self
            .get_deployment(id)
            .map_err(DeployError::Other)?
            .ok_or(DeployError::DeploymentNotFound(id))?;
        if !current.status.can_transition_to(to) {
            return Err(DeployError::InvalidTransition {
                from: current.status,
                to,
            });
        }
        self.conn
            .execute(
                "UPDATE deployments SET
                    status = ?1,
                    image_ref = COALESCE(?2, image_ref),
                    container_id = COALESCE(?3, container_id),
                    endpoint = COALESCE(?4, endpoint),
                    error = COALESCE(?5, error),
                    log_tail = COALESCE(?6, log_tail),
                    updated_at = datetime('now')
                 WHERE id = ?7",
                params![
                    to.as_str(),
                    fields.image_ref,
                    fields.container_id,
                    fields.endpoint,
                    fields.error,
                    fields.log_tail,
                    id
                ],
            )
            .context("Failed to update deployment")
            .map_err(DeployError::Other)?;
        self.get_deployment(id)
            .map_err(DeployError::Other)?
            .ok_or(DeployError::DeploymentNotFound(id))
    }

    /// Advisory resource sample; best-effort, overwrites the previous one.
    pub fn record_usage(&self, id: i64, cpu_pct: f64, mem_bytes: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE deployments SET cpu_pct = ?1, mem_bytes = ?2, updated_at = datetime('now')
                 WHERE id = ?3",
                params![cpu_pct, mem_bytes, id],
            )
            .context("Failed to record usage sample")?;
        Ok(())
    }

    /// Crash recovery: every deployment that was mid-pipeline when the
    /// process died is marked failed. Returns how many were affected.
    pub fn fail_interrupted_deployments(&self, reason: &str) -> Result<usize> {
        let affected = self
            .conn
            .execute(
                "UPDATE deployments SET status = 'failed', error = ?1, updated_at = datetime('now')
                 WHERE status IN ('queued','building','deploying')",
                params![reason],
            )
            .context("Failed to mark interrupted deployments")?;
        Ok(affected)
    }
}

const SELECT_PROJECT: &str = "SELECT id, name, repo_url, branch, build_command, start_command,
    port, subdomain, owner_id, created_at, updated_at FROM projects";

const SELECT_DEPLOYMENT: &str = "SELECT id, project_id, status, image_ref, container_id,
    endpoint, error, log_tail, cpu_pct, mem_bytes, created_at, updated_at FROM deployments";

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        repo_url: row.get(2)?,
        branch: row.get(3)?,
        build_command: row.get(4)?,
        start_command: row.get(5)?,
        port: row.get::<_, Option<i64>>(6)?.map(|p| p as u16),
        subdomain: row.get(7)?,
        owner_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_deployment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Deployment> {
    let status_str: String = row.get(2)?;
    let status = DeploymentStatus::from_str(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Deployment {
        id: row.get(0)?,
        project_id: row.get(1)?,
        status,
        image_ref: row.get(3)?,
        container_id: row.get(4)?,
        endpoint: row.get(5)?,
        error: row.get(6)?,
        log_tail: row.get(7)?,
        cpu_pct: row.get(8)?,
        mem_bytes: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("Failed to read row")?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_project(store: &Store) -> Project {
        store
            .create_project_with_env(
                "demo",
                "https://example.com/demo.git",
                "main",
                "build.sh",
                "run.sh",
                Some(8080),
                "demo",
                "owner-1",
                &[("API_KEY".into(), "v1:AAAA:BBBB".into())],
            )
            .unwrap()
    }

    #[test]
    fn create_project_persists_env_vars_atomically() {
        let store = Store::new_in_memory().unwrap();
        let project = seed_project(&store);
        assert_eq!(project.subdomain, "demo");
        let env = store.list_env_vars(project.id).unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].key, "API_KEY");
    }

    #[test]
    fn duplicate_env_key_rolls_back_entire_create() {
        let store = Store::new_in_memory().unwrap();
        let result = store.create_project_with_env(
            "dup",
            "https://example.com/dup.git",
            "main",
            "build.sh",
            "run.sh",
            None,
            "dup",
            "owner-1",
            &[
                ("KEY".into(), "v1:a:b".into()),
                ("KEY".into(), "v1:c:d".into()),
            ],
        );
        assert!(result.is_err());
        assert!(store.list_projects().unwrap().is_empty());
        assert!(!store.subdomain_taken("dup", None).unwrap());
    }

    #[test]
    fn subdomain_uniqueness_is_enforced_by_schema() {
        let store = Store::new_in_memory().unwrap();
        seed_project(&store);
        assert!(store.subdomain_taken("demo", None).unwrap());
        let result = store.create_project_with_env(
            "other",
            "https://example.com/other.git",
            "main",
            "build.sh",
            "run.sh",
            None,
            "demo",
            "owner-2",
            &[],
        );
        assert!(result.is_err());
        assert_eq!(store.list_projects().unwrap().len(), 1);
    }

    #[test]
    fn subdomain_check_excludes_own_project_on_update() {
        let store = Store::new_in_memory().unwrap();
        let project = seed_project(&store);
        assert!(!store.subdomain_taken("demo", Some(project.id)).unwrap());
    }

    #[test]
    fn delete_project_cascades_to_env_and_deployments() {
        let store = Store::new_in_memory().unwrap();
        let project = seed_project(&store);
        let dep = store.create_deployment(project.id).unwrap();
        assert!(store.delete_project(project.id).unwrap());
        assert!(store.list_env_vars(project.id).unwrap().is_empty());
        assert!(store.get_deployment(dep.id).unwrap().is_none());
    }

    #[test]
    fn list_by_owner_filters() {
        let store = Store::new_in_memory().unwrap();
        seed_project(&store);
        store
            .create_project_with_env(
                "other",
                "https://example.com/o.git",
                "main",
                "make",
                "./run",
                None,
                "other",
                "owner-2",
                &[],
            )
            .unwrap();
        assert_eq!(store.list_projects().unwrap().len(), 2);
        assert_eq!(store.list_projects_by_owner("owner-1").unwrap().len(), 1);
        assert_eq!(store.list_projects_by_owner("nobody").unwrap().len(), 0);
    }

    #[test]
    fn update_project_applies_only_patched_fields() {
        let store = Store::new_in_memory().unwrap();
        let project = seed_project(&store);
        let patch = ProjectPatch {
            branch: Some("develop".into()),
            ..Default::default()
        };
        let updated = store.update_project(project.id, &patch).unwrap().unwrap();
        assert_eq!(updated.branch, "develop");
        assert_eq!(updated.name, "demo");
        assert_eq!(updated.port, Some(8080));
    }

    #[test]
    fn new_deployment_starts_queued_and_is_active() {
        let store = Store::new_in_memory().unwrap();
        let project = seed_project(&store);
        let dep = store.create_deployment(project.id).unwrap();
        assert_eq!(dep.status, DeploymentStatus::Queued);
        let active = store.find_active_deployment(project.id).unwrap().unwrap();
        assert_eq!(active.id, dep.id);
    }

    #[test]
    fn transition_walks_the_happy_path() {
        let store = Store::new_in_memory().unwrap();
        let project = seed_project(&store);
        let dep = store.create_deployment(project.id).unwrap();
        let dep = store
            .transition_deployment(dep.id, DeploymentStatus::Building, TransitionFields::default())
            .unwrap();
        let dep = store
            .transition_deployment(
                dep.id,
                DeploymentStatus::Deploying,
                TransitionFields {
                    image_ref: Some("berth/demo:abc123".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(dep.image_ref.as_deref(), Some("berth/demo:abc123"));
        let dep = store
            .transition_deployment(
                dep.id,
                DeploymentStatus::Healthy,
                TransitionFields {
                    container_id: Some("c1".into()),
                    endpoint: Some("berth-demo-1:8080".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(dep.status, DeploymentStatus::Healthy);
        assert!(store.find_active_deployment(project.id).unwrap().is_none());
        assert!(store.find_healthy_deployment(project.id).unwrap().is_some());
    }

    #[test]
    fn invalid_transition_is_rejected_and_leaves_row_unchanged() {
        let store = Store::new_in_memory().unwrap();
        let project = seed_project(&store);
        let dep = store.create_deployment(project.id).unwrap();
        store
            .transition_deployment(
                dep.id,
                DeploymentStatus::Failed,
                TransitionFields {
                    error: Some("boom".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let err = store
            .transition_deployment(dep.id, DeploymentStatus::Building, TransitionFields::default())
            .unwrap_err();
        assert!(matches!(err, DeployError::InvalidTransition { .. }));
        let dep = store.get_deployment(dep.id).unwrap().unwrap();
        assert_eq!(dep.status, DeploymentStatus::Failed);
        assert_eq!(dep.error.as_deref(), Some("boom"));
    }

    #[test]
    fn fail_interrupted_touches_only_active_deployments() {
        let store = Store::new_in_memory().unwrap();
        let project = seed_project(&store);
        let active = store.create_deployment(project.id).unwrap();
        let done = store.create_deployment(project.id).unwrap();
        store
            .transition_deployment(done.id, DeploymentStatus::Building, TransitionFields::default())
            .unwrap();
        store
            .transition_deployment(done.id, DeploymentStatus::Deploying, TransitionFields::default())
            .unwrap();
        store
            .transition_deployment(done.id, DeploymentStatus::Healthy, TransitionFields::default())
            .unwrap();

        let affected = store.fail_interrupted_deployments("orchestrator restarted").unwrap();
        assert_eq!(affected, 1);
        let failed = store.get_deployment(active.id).unwrap().unwrap();
        assert_eq!(failed.status, DeploymentStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("orchestrator restarted"));
        let healthy = store.get_deployment(done.id).unwrap().unwrap();
        assert_eq!(healthy.status, DeploymentStatus::Healthy);
    }

    #[test]
    fn record_usage_is_advisory() {
        let store = Store::new_in_memory().unwrap();
        let project = seed_project(&store);
        let dep = store.create_deployment(project.id).unwrap();
        store.record_usage(dep.id, 12.5, 64 * 1024 * 1024).unwrap();
        let dep = store.get_deployment(dep.id).unwrap().unwrap();
        assert_eq!(dep.cpu_pct, Some(12.5));
        assert_eq!(dep.mem_bytes, Some(64 * 1024 * 1024));
    }
}
