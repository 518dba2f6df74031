//! Typed error hierarchy for the berth orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `VaultError` — secret seal/unseal failures (per-value, never fatal)
//! - `RegistryError` — project/env-var validation and lookup failures
//! - `DeployError` — admission, build, and container lifecycle failures

use thiserror::Error;

use crate::models::DeploymentStatus;

/// Errors from the secret vault. Both decode variants are scoped to the
/// single ciphertext record being processed.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("ciphertext record is malformed: {0}")]
    Format(String),

    #[error("authentication tag verification failed")]
    Integrity,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed")]
    Seal,
}

/// Errors from the project registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid project definition: {0}")]
    Validation(String),

    #[error("subdomain '{0}' is already taken")]
    SubdomainTaken(String),

    #[error("project {0} not found")]
    ProjectNotFound(i64),

    #[error("env var '{key}' for project {project_id} not found")]
    EnvVarNotFound { project_id: i64, key: String },

    #[error("vault is not configured; secret operations are unavailable")]
    VaultUnavailable,

    #[error("failed to unseal env var '{key}': {source}")]
    Unseal {
        key: String,
        #[source]
        source: VaultError,
    },

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

/// Errors from the deployment state machine and its pipeline stages.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("a deployment is already in progress for project {project_id}")]
    DeploymentInProgress { project_id: i64 },

    #[error("container runtime is unavailable; deploys are disabled")]
    RuntimeUnavailable,

    #[error("invalid deployment transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("deployment {0} not found")]
    DeploymentNotFound(i64),

    #[error("project has no active deployment to stop")]
    NothingToStop,

    #[error("source fetch failed: {0}")]
    FetchFailed(String),

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("build exceeded the {0}s wall-clock timeout")]
    BuildTimeout(u64),

    #[error("container failed to start: {0}")]
    ContainerStart(String),

    #[error("container did not pass a readiness probe within {0}s")]
    ProbeTimeout(u64),

    #[error("deployment cancelled by operator")]
    Cancelled,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_error_messages_never_carry_plaintext() {
        let err = VaultError::Format("expected 3 ':'-delimited parts".into());
        assert!(err.to_string().contains("malformed"));
        assert!(matches!(VaultError::Integrity, VaultError::Integrity));
    }

    #[test]
    fn deploy_error_in_progress_carries_project_id() {
        let err = DeployError::DeploymentInProgress { project_id: 7 };
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn invalid_transition_names_both_states() {
        let err = DeployError::InvalidTransition {
            from: DeploymentStatus::Failed,
            to: DeploymentStatus::Building,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed") && msg.contains("Building"));
    }

    #[test]
    fn registry_error_converts_into_deploy_error() {
        let err: DeployError = RegistryError::ProjectNotFound(3).into();
        assert!(matches!(
            err,
            DeployError::Registry(RegistryError::ProjectNotFound(3))
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&VaultError::Integrity);
        assert_std_error(&RegistryError::VaultUnavailable);
        assert_std_error(&DeployError::RuntimeUnavailable);
    }
}
