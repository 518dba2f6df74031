//! Project registry: CRUD over project definitions and the env-var
//! lifecycle. Plaintext secrets cross this boundary in exactly one place,
//! `resolve_env_vars`, whose `ResolvedEnv` return type is deliberately not
//! serializable and redacts values in its Debug output. Every public read
//! path returns masked views.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;

use crate::db::{DbHandle, ProjectPatch};
use crate::errors::RegistryError;
use crate::models::{EnvVarView, Project, ProjectView};
use crate::vault::Vault;

static SUBDOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("static regex"));
static ENV_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

const MAX_SUBDOMAIN_LEN: usize = 63;

/// A new project definition as submitted by a caller.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Empty means no build step; the source tree is packaged as-is.
    #[serde(default)]
    pub build_command: Option<String>,
    pub start_command: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub subdomain: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// Decrypted env vars assembled for one deployment's execution environment.
///
/// This type is the only carrier of secret plaintext outside the vault. It
/// has no serde impls on purpose, and its Debug output shows keys only.
pub struct ResolvedEnv {
    vars: HashMap<String, String>,
}

impl ResolvedEnv {
    pub fn empty() -> Self {
        Self {
            vars: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            vars: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// `KEY=value` pairs for process/container environment injection.
    pub fn to_env_strings(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        out.sort();
        out
    }
}

impl std::fmt::Debug for ResolvedEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.vars.keys().map(String::as_str).collect();
        keys.sort();
        f.debug_struct("ResolvedEnv").field("keys", &keys).finish()
    }
}

pub struct Registry {
    db: DbHandle,
    vault: Option<Arc<Vault>>,
}

impl Registry {
    pub fn new(db: DbHandle, vault: Option<Arc<Vault>>) -> Self {
        Self { db, vault }
    }

    fn vault(&self) -> Result<&Vault, RegistryError> {
        self.vault
            .as_deref()
            .ok_or(RegistryError::VaultUnavailable)
    }

    /// Create a project and its initial env vars atomically. Nothing is
    /// persisted when validation or any seal fails.
    pub async fn create(
        &self,
        def: NewProject,
        owner_id: &str,
    ) -> Result<ProjectView, RegistryError> {
        validate_definition(&def)?;
        let mut sealed: Vec<(String, String)> = Vec::with_capacity(def.env_vars.len());
        if !def.env_vars.is_empty() {
            let vault = self.vault()?;
            for (key, value) in &def.env_vars {
                validate_env_key(key)?;
                let ciphertext = vault.seal(value).map_err(|source| RegistryError::Unseal {
                    key: key.clone(),
                    source,
                })?;
                sealed.push((key.clone(), ciphertext));
            }
            sealed.sort();
        }

        let owner = owner_id.to_string();
        let project = self
            .db
            .call(move |s| {
                if s.subdomain_taken(&def.subdomain, None)? {
                    return Ok(Err(RegistryError::SubdomainTaken(def.subdomain.clone())));
                }
                let project = s.create_project_with_env(
                    &def.name,
                    &def.repo_url,
                    def.branch.as_deref().unwrap_or("main"),
                    def.build_command.as_deref().unwrap_or(""),
                    &def.start_command,
                    def.port,
                    &def.subdomain,
                    &owner,
                    &sealed,
                )?;
                Ok(Ok(project))
            })
            .await
            .map_err(RegistryError::Database)??;
        self.view_of(project).await
    }

    /// Raw project record, for internal collaborators (orchestrator, API
    /// ownership checks). Not a leak: it carries no env-var material.
    pub async fn get(&self, id: i64) -> Result<Project, RegistryError> {
        self.db
            .call(move |s| s.get_project(id))
            .await
            .map_err(RegistryError::Database)?
            .ok_or(RegistryError::ProjectNotFound(id))
    }

    pub async fn get_view(&self, id: i64) -> Result<ProjectView, RegistryError> {
        let project = self.get(id).await?;
        self.view_of(project).await
    }

    pub async fn list_all(&self) -> Result<Vec<ProjectView>, RegistryError> {
        let projects = self
            .db
            .call(|s| s.list_projects())
            .await
            .map_err(RegistryError::Database)?;
        self.views_of(projects).await
    }

    pub async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<ProjectView>, RegistryError> {
        let owner = owner_id.to_string();
        let projects = self
            .db
            .call(move |s| s.list_projects_by_owner(&owner))
            .await
            .map_err(RegistryError::Database)?;
        self.views_of(projects).await
    }

    pub async fn update(
        &self,
        id: i64,
        patch: ProjectPatch,
    ) -> Result<ProjectView, RegistryError> {
        if let Some(ref subdomain) = patch.subdomain {
            validate_subdomain(subdomain)?;
        }
        if let Some(ref name) = patch.name
            && name.trim().is_empty()
        {
            return Err(RegistryError::Validation("name must not be empty".into()));
        }
        let project = self
            .db
            .call(move |s| {
                if let Some(ref subdomain) = patch.subdomain {
                    if s.subdomain_taken(subdomain, Some(id))? {
                        return Ok(Err(RegistryError::SubdomainTaken(subdomain.clone())));
                    }
                    // A live route is keyed by the current subdomain;
                    // renaming it out from under a running or in-flight
                    // deployment would strand that route.
                    let changing = match s.get_project(id)? {
                        Some(current) => current.subdomain != *subdomain,
                        None => return Ok(Err(RegistryError::ProjectNotFound(id))),
                    };
                    if changing
                        && (s.find_healthy_deployment(id)?.is_some()
                            || s.find_active_deployment(id)?.is_some())
                    {
                        return Ok(Err(RegistryError::Validation(
                            "subdomain cannot be changed while a deployment is live or in flight; stop it first"
                                .into(),
                        )));
                    }
                }
                match s.update_project(id, &patch)? {
                    Some(project) => Ok(Ok(project)),
                    None => Ok(Err(RegistryError::ProjectNotFound(id))),
                }
            })
            .await
            .map_err(RegistryError::Database)??;
        self.view_of(project).await
    }

    pub async fn delete(&self, id: i64) -> Result<(), RegistryError> {
        let deleted = self
            .db
            .call(move |s| s.delete_project(id))
            .await
            .map_err(RegistryError::Database)?;
        if deleted {
            Ok(())
        } else {
            Err(RegistryError::ProjectNotFound(id))
        }
    }

    pub async fn set_env_var(
        &self,
        project_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), RegistryError> {
        validate_env_key(key)?;
        let ciphertext = self
            .vault()?
            .seal(value)
            .map_err(|source| RegistryError::Unseal {
                key: key.to_string(),
                source,
            })?;
        let key = key.to_string();
        self.db
            .call(move |s| {
                if s.get_project(project_id)?.is_none() {
                    return Ok(Err(RegistryError::ProjectNotFound(project_id)));
                }
                s.upsert_env_var(project_id, &key, &ciphertext)?;
                Ok(Ok(()))
            })
            .await
            .map_err(RegistryError::Database)?
    }

    pub async fn delete_env_var(&self, project_id: i64, key: &str) -> Result<(), RegistryError> {
        let key_owned = key.to_string();
        let deleted = self
            .db
            .call(move |s| s.delete_env_var(project_id, &key_owned))
            .await
            .map_err(RegistryError::Database)?;
        if deleted {
            Ok(())
        } else {
            Err(RegistryError::EnvVarNotFound {
                project_id,
                key: key.to_string(),
            })
        }
    }

    /// Decrypt all env vars for runtime injection. Consumed solely by the
    /// deployment pipeline; a single undecryptable record fails the whole
    /// resolve with the offending key named (and nothing else).
    pub async fn resolve_env_vars(&self, project_id: i64) -> Result<ResolvedEnv, RegistryError> {
        let records = self
            .db
            .call(move |s| s.list_env_vars(project_id))
            .await
            .map_err(RegistryError::Database)?;
        if records.is_empty() {
            return Ok(ResolvedEnv::empty());
        }
        let vault = self.vault()?;
        let mut vars = HashMap::with_capacity(records.len());
        for record in records {
            let plaintext =
                vault
                    .unseal(&record.ciphertext)
                    .map_err(|source| RegistryError::Unseal {
                        key: record.key.clone(),
                        source,
                    })?;
            vars.insert(record.key, plaintext);
        }
        Ok(ResolvedEnv { vars })
    }

    async fn view_of(&self, project: Project) -> Result<ProjectView, RegistryError> {
        let project_id = project.id;
        let env = self
            .db
            .call(move |s| s.list_env_vars(project_id))
            .await
            .map_err(RegistryError::Database)?;
        Ok(ProjectView {
            project,
            env_vars: env.iter().map(|e| EnvVarView::masked(&e.key)).collect(),
        })
    }

    async fn views_of(&self, projects: Vec<Project>) -> Result<Vec<ProjectView>, RegistryError> {
        let mut views = Vec::with_capacity(projects.len());
        for project in projects {
            views.push(self.view_of(project).await?);
        }
        Ok(views)
    }
}

fn validate_definition(def: &NewProject) -> Result<(), RegistryError> {
    if def.name.trim().is_empty() {
        return Err(RegistryError::Validation("name must not be empty".into()));
    }
    if def.repo_url.trim().is_empty() {
        return Err(RegistryError::Validation(
            "repo_url must not be empty".into(),
        ));
    }
    if def.start_command.trim().is_empty() {
        return Err(RegistryError::Validation(
            "start_command must not be empty".into(),
        ));
    }
    if let Some(0) = def.port {
        return Err(RegistryError::Validation("port must be non-zero".into()));
    }
    validate_subdomain(&def.subdomain)
}

fn validate_subdomain(subdomain: &str) -> Result<(), RegistryError> {
    if subdomain.is_empty() || subdomain.len() > MAX_SUBDOMAIN_LEN {
        return Err(RegistryError::Validation(format!(
            "subdomain must be 1-{} characters",
            MAX_SUBDOMAIN_LEN
        )));
    }
    if !SUBDOMAIN_RE.is_match(subdomain) {
        return Err(RegistryError::Validation(
            "subdomain may only contain lowercase letters, digits, and hyphens".into(),
        ));
    }
    Ok(())
}

fn validate_env_key(key: &str) -> Result<(), RegistryError> {
    if !ENV_KEY_RE.is_match(key) {
        return Err(RegistryError::Validation(format!(
            "invalid env var key '{}'",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::models::ENV_VALUE_MASK;

    fn test_registry() -> Registry {
        let db = DbHandle::new(Store::new_in_memory().unwrap());
        let vault = Vault::new("test-master-secret", "berth-vault-v1").unwrap();
        Registry::new(db, Some(Arc::new(vault)))
    }

    fn demo_project() -> NewProject {
        NewProject {
            name: "demo".into(),
            repo_url: "https://example.com/demo.git".into(),
            branch: Some("main".into()),
            build_command: Some("build.sh".into()),
            start_command: "run.sh".into(),
            port: Some(8080),
            subdomain: "demo".into(),
            env_vars: HashMap::from([("API_KEY".to_string(), "s3cret".to_string())]),
        }
    }

    #[tokio::test]
    async fn create_returns_masked_view() {
        let registry = test_registry();
        let view = registry.create(demo_project(), "owner-1").await.unwrap();
        assert_eq!(view.project.subdomain, "demo");
        assert_eq!(view.env_vars.len(), 1);
        assert_eq!(view.env_vars[0].key, "API_KEY");
        assert_eq!(view.env_vars[0].value, ENV_VALUE_MASK);
    }

    #[tokio::test]
    async fn duplicate_subdomain_fails_before_persisting() {
        let registry = test_registry();
        registry.create(demo_project(), "owner-1").await.unwrap();
        let mut second = demo_project();
        second.name = "other".into();
        let err = registry.create(second, "owner-2").await.unwrap_err();
        assert!(matches!(err, RegistryError::SubdomainTaken(_)));
        assert_eq!(registry.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subdomain_charset_is_validated() {
        let registry = test_registry();
        for bad in ["", "UPPER", "under_score", "spa ce", "dot.ted"] {
            let mut def = demo_project();
            def.subdomain = bad.into();
            let err = registry.create(def, "owner-1").await.unwrap_err();
            assert!(matches!(err, RegistryError::Validation(_)), "'{}'", bad);
        }
    }

    #[tokio::test]
    async fn resolve_env_vars_round_trips_plaintext() {
        let registry = test_registry();
        let view = registry.create(demo_project(), "owner-1").await.unwrap();
        let env = registry.resolve_env_vars(view.project.id).await.unwrap();
        assert_eq!(env.get("API_KEY"), Some("s3cret"));
        assert_eq!(env.to_env_strings(), vec!["API_KEY=s3cret".to_string()]);
    }

    #[tokio::test]
    async fn resolved_env_debug_redacts_values() {
        let registry = test_registry();
        let view = registry.create(demo_project(), "owner-1").await.unwrap();
        let env = registry.resolve_env_vars(view.project.id).await.unwrap();
        let debug = format!("{:?}", env);
        assert!(debug.contains("API_KEY"));
        assert!(!debug.contains("s3cret"));
    }

    #[tokio::test]
    async fn set_and_delete_env_var() {
        let registry = test_registry();
        let view = registry.create(demo_project(), "owner-1").await.unwrap();
        let id = view.project.id;
        registry.set_env_var(id, "EXTRA", "value").await.unwrap();
        let env = registry.resolve_env_vars(id).await.unwrap();
        assert_eq!(env.len(), 2);

        registry.delete_env_var(id, "EXTRA").await.unwrap();
        let err = registry.delete_env_var(id, "EXTRA").await.unwrap_err();
        assert!(matches!(err, RegistryError::EnvVarNotFound { .. }));
    }

    #[tokio::test]
    async fn set_env_var_overwrites_existing_key() {
        let registry = test_registry();
        let view = registry.create(demo_project(), "owner-1").await.unwrap();
        let id = view.project.id;
        registry.set_env_var(id, "API_KEY", "rotated").await.unwrap();
        let env = registry.resolve_env_vars(id).await.unwrap();
        assert_eq!(env.get("API_KEY"), Some("rotated"));
        assert_eq!(env.len(), 1);
    }

    #[tokio::test]
    async fn env_ops_without_vault_fail_fast() {
        let db = DbHandle::new(Store::new_in_memory().unwrap());
        let registry = Registry::new(db, None);
        let err = registry.create(demo_project(), "owner-1").await.unwrap_err();
        assert!(matches!(err, RegistryError::VaultUnavailable));

        // A definition without env vars needs no vault at all.
        let mut def = demo_project();
        def.env_vars.clear();
        assert!(registry.create(def, "owner-1").await.is_ok());
    }

    #[tokio::test]
    async fn update_validates_and_applies_subdomain_change() {
        let registry = test_registry();
        let view = registry.create(demo_project(), "owner-1").await.unwrap();
        let updated = registry
            .update(
                view.project.id,
                ProjectPatch {
                    subdomain: Some("demo-v2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.project.subdomain, "demo-v2");

        let err = registry
            .update(
                view.project.id,
                ProjectPatch {
                    subdomain: Some("Bad!".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[tokio::test]
    async fn subdomain_change_is_rejected_while_a_deployment_exists() {
        use crate::db::TransitionFields;
        use crate::models::DeploymentStatus;

        let db = DbHandle::new(Store::new_in_memory().unwrap());
        let vault = Vault::new("test-master-secret", "berth-vault-v1").unwrap();
        let registry = Registry::new(db.clone(), Some(Arc::new(vault)));
        let view = registry.create(demo_project(), "owner-1").await.unwrap();
        let id = view.project.id;

        // An in-flight deployment blocks the rename.
        let dep = db.call(move |s| s.create_deployment(id)).await.unwrap();
        let rename = ProjectPatch {
            subdomain: Some("demo-v2".into()),
            ..Default::default()
        };
        let err = registry.update(id, rename.clone()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));

        // Other fields may still change, and re-submitting the current
        // subdomain is a no-op.
        registry
            .update(
                id,
                ProjectPatch {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        registry
            .update(
                id,
                ProjectPatch {
                    subdomain: Some("demo".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Once the deployment is terminal the rename goes through.
        let dep_id = dep.id;
        db.call(move |s| {
            s.transition_deployment(dep_id, DeploymentStatus::Failed, TransitionFields::default())
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(())
        })
        .await
        .unwrap();
        let updated = registry.update(id, rename).await.unwrap();
        assert_eq!(updated.project.subdomain, "demo-v2");
    }

    #[tokio::test]
    async fn delete_cascades_and_404s_after() {
        let registry = test_registry();
        let view = registry.create(demo_project(), "owner-1").await.unwrap();
        registry.delete(view.project.id).await.unwrap();
        let err = registry.get(view.project.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::ProjectNotFound(_)));
        let err = registry.delete(view.project.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::ProjectNotFound(_)));
    }
}
