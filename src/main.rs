mod api;
mod app_state;
mod config;
mod core;
mod domain;
mod errors;
mod routes;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::app_state::{build_app_state, AppState};
use crate::config::AppConfig;
use crate::core::client::context_registry::ClusterRegistry;
use crate::core::client::kubeconfig::{discover, initial_context};
use crate::core::client::pods::KubePodConnector;
use crate::core::client::resource_kinds::KindTable;
use crate::core::client::watchers::KubeWatchSource;
use crate::core::logging::init_logging;
use crate::domain::session::service::session_manager::REASON_SHUTDOWN;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env();
    let _log_guard = init_logging(&config.log_dir)?;

    let discovered = discover()?;
    let initial = initial_context(&discovered, config.initial_context.as_deref())?;
    let registry = Arc::new(ClusterRegistry::new(discovered.contexts, &initial)?);

    let kinds = Arc::new(KindTable::standard());
    let state = build_app_state(
        &config,
        registry,
        kinds.clone(),
        Arc::new(KubeWatchSource::new(kinds)),
        Arc::new(KubePodConnector),
    );
    let app = routes::app_router(state.clone());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("kubedeck-core listening on {} (context '{}')", config.bind_addr, initial);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let closed = state.sessions.close_all(REASON_SHUTDOWN);
    info!("Shutting down, {} session(s) closed", closed);
}
