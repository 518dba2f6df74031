//! Process wiring: construct the shared state, mount the HTTP router, and
//! run the server with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{self, AppState, SharedState};
use crate::auth::AuthKeys;
use crate::build::ShellBuilder;
use crate::config::Config;
use crate::db::{DbHandle, Store};
use crate::deploy::Orchestrator;
use crate::logs::LogBroadcaster;
use crate::registry::Registry;
use crate::router::SubdomainRouter;
use crate::runtime::{ContainerRuntime, DockerRuntime, NullRuntime};
use crate::vault::Vault;

/// Assemble the application state from configuration. The engine
/// connection is constructed lazily; a missing engine or vault secret
/// yields a degraded (read-only) instance rather than a startup failure.
pub fn build_state(config: Config, store: Store) -> Result<SharedState> {
    if config.auth_secret.is_empty() {
        warn!("BERTH_AUTH_SECRET is empty; tokens signed with an empty key");
    }
    let db = DbHandle::new(store);

    let vault = match config.vault_secret.as_deref() {
        Some(secret) => Some(Arc::new(Vault::new(secret, &config.vault_salt)?)),
        None => None,
    };
    let vault_present = vault.is_some();

    let runtime: Arc<dyn ContainerRuntime> = match DockerRuntime::connect() {
        Ok(docker) => Arc::new(docker),
        Err(e) => {
            warn!(error = %e, "could not construct engine client; deploys disabled");
            Arc::new(NullRuntime)
        }
    };

    let registry = Arc::new(Registry::new(db.clone(), vault));
    let router = Arc::new(SubdomainRouter::new());
    let logs = Arc::new(LogBroadcaster::new(config.log_buffer_lines));
    let builder = Arc::new(ShellBuilder::new(config.build_timeout()));
    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        Arc::clone(&registry),
        runtime,
        builder,
        Arc::clone(&router),
        Arc::clone(&logs),
        config.clone(),
        vault_present,
    ));
    let auth = AuthKeys::new(config.auth_secret.as_bytes());

    Ok(Arc::new(AppState {
        config,
        db,
        registry,
        orchestrator,
        router,
        logs,
        auth,
    }))
}

pub fn build_router(state: SharedState) -> Router {
    api::routes()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: Config) -> Result<()> {
    let store = Store::new(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?;
    let state = build_state(config, store)?;
    state.orchestrator.startup().await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(
        %addr,
        super_domain = %state.config.super_domain,
        deploys_enabled = state.orchestrator.deploys_enabled(),
        "berth listening"
    );

    let orchestrator = Arc::clone(&state.orchestrator);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    orchestrator.shutdown().await;
    Ok(())
}
