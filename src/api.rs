//! HTTP surface: error envelope, shared state, and route handlers.
//!
//! Every handler resolves the caller's `Identity` first and funnels
//! authorization through `Identity::can_manage`. Project reads return
//! masked views only; deployment log streams are SSE with full replay.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{FromRef, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use futures::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;

use crate::auth::{AuthKeys, Identity};
use crate::config::Config;
use crate::db::{DbHandle, ProjectPatch};
use crate::deploy::Orchestrator;
use crate::errors::{DeployError, RegistryError};
use crate::logs::{LogBroadcaster, LogEvent};
use crate::models::Project;
use crate::registry::{NewProject, Registry};
use crate::router::SubdomainRouter;

pub struct AppState {
    pub config: Config,
    pub db: DbHandle,
    pub registry: Arc<Registry>,
    pub orchestrator: Arc<Orchestrator>,
    pub router: Arc<SubdomainRouter>,
    pub logs: Arc<LogBroadcaster>,
    pub auth: AuthKeys,
}

pub type SharedState = Arc<AppState>;

impl FromRef<SharedState> for AuthKeys {
    fn from_ref(state: &SharedState) -> AuthKeys {
        state.auth.clone()
    }
}

/// API-level error with a JSON `{"error": ...}` envelope. Internal causes
/// are logged server-side and never echoed to the caller.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(err) => {
                error!(error = %err, "internal error serving request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Validation(_) | RegistryError::SubdomainTaken(_) => {
                ApiError::BadRequest(err.to_string())
            }
            RegistryError::ProjectNotFound(_) | RegistryError::EnvVarNotFound { .. } => {
                ApiError::NotFound(err.to_string())
            }
            RegistryError::VaultUnavailable => ApiError::Unavailable(err.to_string()),
            RegistryError::Unseal { .. } => ApiError::Internal(err.into()),
            RegistryError::Database(e) => ApiError::Internal(e),
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::DeploymentInProgress { .. }
            | DeployError::NothingToStop
            | DeployError::InvalidTransition { .. } => ApiError::Conflict(err.to_string()),
            DeployError::RuntimeUnavailable => ApiError::Unavailable(err.to_string()),
            DeployError::DeploymentNotFound(_) => ApiError::NotFound(err.to_string()),
            DeployError::Registry(e) => e.into(),
            DeployError::Other(e) => ApiError::Internal(e),
            other => ApiError::Internal(other.into()),
        }
    }
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/projects", post(create_project).get(list_projects))
        .route(
            "/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route(
            "/projects/{id}/env/{key}",
            put(set_env_var).delete(delete_env_var),
        )
        .route("/projects/{id}/deploy", post(deploy_project))
        .route("/projects/{id}/stop", post(stop_project))
        .route("/deployments/{id}", get(get_deployment))
        .route("/deployments/{id}/logs/stream", get(stream_deployment_logs))
}

/// Fetch a project and require manage rights over it. 404 when it does not
/// exist, 403 when it belongs to someone else.
async fn managed_project(
    state: &AppState,
    identity: &Identity,
    id: i64,
) -> Result<Project, ApiError> {
    let project = state.registry.get(id).await?;
    if !identity.can_manage(&project.owner_id) {
        return Err(ApiError::Forbidden(
            "you do not have access to this project".into(),
        ));
    }
    Ok(project)
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "deploys_enabled": state.orchestrator.deploys_enabled(),
        "routes": state.router.len(),
    }))
}

async fn create_project(
    State(state): State<SharedState>,
    identity: Identity,
    Json(def): Json<NewProject>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.registry.create(def, &identity.user_id).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_projects(
    State(state): State<SharedState>,
    identity: Identity,
) -> Result<impl IntoResponse, ApiError> {
    let views = if identity.is_admin() {
        state.registry.list_all().await?
    } else {
        state.registry.list_by_owner(&identity.user_id).await?
    };
    Ok(Json(views))
}

async fn get_project(
    State(state): State<SharedState>,
    identity: Identity,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    managed_project(&state, &identity, id).await?;
    let view = state.registry.get_view(id).await?;
    Ok(Json(view))
}

async fn update_project(
    State(state): State<SharedState>,
    identity: Identity,
    Path(id): Path<i64>,
    Json(patch): Json<ProjectPatch>,
) -> Result<impl IntoResponse, ApiError> {
    managed_project(&state, &identity, id).await?;
    let view = state.registry.update(id, patch).await?;
    Ok(Json(view))
}

async fn delete_project(
    State(state): State<SharedState>,
    identity: Identity,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = managed_project(&state, &identity, id).await?;
    // A live deployment for this project is stopped first; a failure to
    // stop leaves the project in place.
    match state.orchestrator.stop(&project).await {
        Ok(_) | Err(DeployError::NothingToStop) => {}
        Err(e) => return Err(e.into()),
    }
    let history = state
        .db
        .call(move |s| s.list_deployments(id))
        .await
        .map_err(ApiError::Internal)?;
    state.registry.delete(id).await?;
    for deployment in history {
        state.logs.evict(deployment.id);
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EnvValueBody {
    value: String,
}

async fn set_env_var(
    State(state): State<SharedState>,
    identity: Identity,
    Path((id, key)): Path<(i64, String)>,
    Json(body): Json<EnvValueBody>,
) -> Result<impl IntoResponse, ApiError> {
    managed_project(&state, &identity, id).await?;
    state.registry.set_env_var(id, &key, &body.value).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_env_var(
    State(state): State<SharedState>,
    identity: Identity,
    Path((id, key)): Path<(i64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    managed_project(&state, &identity, id).await?;
    state.registry.delete_env_var(id, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deploy_project(
    State(state): State<SharedState>,
    identity: Identity,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = managed_project(&state, &identity, id).await?;
    let subdomain = project.subdomain.clone();
    let deployment = state.orchestrator.deploy(project).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "deployment_id": deployment.id,
            "status": deployment.status,
            "app_url": state.config.app_url(&subdomain),
        })),
    ))
}

async fn stop_project(
    State(state): State<SharedState>,
    identity: Identity,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = managed_project(&state, &identity, id).await?;
    let deployment = state.orchestrator.stop(&project).await?;
    Ok(Json(deployment))
}

async fn get_deployment(
    State(state): State<SharedState>,
    identity: Identity,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = state
        .db
        .call(move |s| s.get_deployment(id))
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound(format!("deployment {} not found", id)))?;
    managed_project(&state, &identity, deployment.project_id).await?;
    Ok(Json(deployment))
}

/// SSE log stream: buffered lines are replayed in order, then live lines
/// follow. The stream ends shortly after the deployment reaches a terminal
/// state; clients see a final `close` event.
async fn stream_deployment_logs(
    State(state): State<SharedState>,
    identity: Identity,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let deployment = state
        .db
        .call(move |s| s.get_deployment(id))
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound(format!("deployment {} not found", id)))?;
    managed_project(&state, &identity, deployment.project_id).await?;

    let rx = state.logs.subscribe(id);
    // The broadcaster drops its sender when the stream closes, so the
    // receiver (and thus the SSE connection) terminates after `close`.
    let stream = ReceiverStream::new(rx).map(|event| {
        Ok(match event {
            LogEvent::Line(line) => Event::default().data(line),
            LogEvent::Closed => Event::default().event("close").data("end of stream"),
        })
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
