use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Placeholder returned in place of env-var values on every public read path.
pub const ENV_VALUE_MASK: &str = "********";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub build_command: String,
    pub start_command: String,
    pub port: Option<u16>,
    pub subdomain: String,
    pub owner_id: String,
    pub created_at: String,
    pub updated_at: String,
}

/// An encrypted environment variable as persisted. The value field is the
/// vault ciphertext record; plaintext never touches this type.
#[derive(Debug, Clone)]
pub struct EnvVar {
    pub id: i64,
    pub project_id: i64,
    pub key: String,
    pub ciphertext: String,
}

/// A project as seen by API callers: env-var values are masked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectView {
    #[serde(flatten)]
    pub project: Project,
    pub env_vars: Vec<EnvVarView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVarView {
    pub key: String,
    pub value: String,
}

impl EnvVarView {
    pub fn masked(key: &str) -> Self {
        Self {
            key: key.to_string(),
            value: ENV_VALUE_MASK.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Queued,
    Building,
    Deploying,
    Healthy,
    Failed,
    Stopped,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Healthy => "healthy",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// A deployment in one of these states holds the project's single
    /// in-flight pipeline slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Building | Self::Deploying)
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }

    /// The full transition table of the deployment state machine.
    /// Everything not listed here is rejected as `InvalidTransition`.
    pub fn can_transition_to(&self, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, to),
            (Queued, Building)
                | (Queued, Failed)
                | (Building, Deploying)
                | (Building, Failed)
                | (Deploying, Healthy)
                | (Deploying, Failed)
                | (Healthy, Stopped)
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "building" => Ok(Self::Building),
            "deploying" => Ok(Self::Deploying),
            "healthy" => Ok(Self::Healthy),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub project_id: i64,
    pub status: DeploymentStatus,
    pub image_ref: Option<String>,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    pub error: Option<String>,
    pub log_tail: Option<String>,
    pub cpu_pct: Option<f64>,
    pub mem_bytes: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}
