//! Switching the active cluster context.
//!
//! A switch swaps the registry's active context, then tears down what was
//! bound to the old one: sessions are closed, watches are resynced or closed.
//! An unreachable target is reported but never blocks the swap.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::client::context_registry::{ClusterRegistry, ReloadSummary};
use crate::core::client::kube_client::probe;
use crate::core::client::kubeconfig::{discover, ContextSpec};
use crate::domain::session::service::session_manager::{SessionManager, REASON_CONTEXT_CHANGED};
use crate::domain::watch::service::watch_hub::WatchHub;
use crate::errors::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchOutcome {
    pub context: String,
    pub namespace: String,
    pub previous: String,
    pub generation: u64,
    /// False when the target was already active and nothing was torn down.
    pub switched: bool,
    pub reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub sessions_closed: usize,
    pub watches_resynced: usize,
    pub watches_closed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadOutcome {
    #[serde(flatten)]
    pub contexts: ReloadSummary,
    /// Present when the active context's parameters changed and it was re-entered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub switch: Option<SwitchOutcome>,
}

pub struct SwitchCoordinator {
    registry: Arc<ClusterRegistry>,
    hub: Arc<WatchHub>,
    sessions: Arc<SessionManager>,
    probe_timeout: Duration,
    // Switches and reloads run one at a time.
    lock: Mutex<()>,
}

impl SwitchCoordinator {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        hub: Arc<WatchHub>,
        sessions: Arc<SessionManager>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            hub,
            sessions,
            probe_timeout,
            lock: Mutex::new(()),
        }
    }

    pub async fn switch_to(&self, name: &str) -> Result<SwitchOutcome, AppError> {
        let _guard = self.lock.lock().await;
        self.switch_locked(name, false).await
    }

    /// Re-read kubeconfig and merge it into the registry.
    pub async fn reload(&self) -> Result<ReloadOutcome, AppError> {
        let discovered = tokio::task::spawn_blocking(discover)
            .await
            .map_err(|e| AppError::InternalServerError(format!("kubeconfig discovery panicked: {e}")))??;
        self.reload_with(discovered.contexts).await
    }

    pub async fn reload_with(&self, specs: Vec<ContextSpec>) -> Result<ReloadOutcome, AppError> {
        let _guard = self.lock.lock().await;

        let active = self.registry.active().name().to_string();
        let contexts = self.registry.replace_contexts(specs);
        info!(
            "Contexts reloaded: {} added, {} replaced, {} removed",
            contexts.added.len(),
            contexts.replaced.len(),
            contexts.removed.len()
        );

        // The active context points at the old parameters until re-entered.
        let switch = if contexts.replaced.contains(&active) {
            Some(self.switch_locked(&active, true).await?)
        } else {
            None
        };

        Ok(ReloadOutcome { contexts, switch })
    }

    async fn switch_locked(&self, name: &str, force: bool) -> Result<SwitchOutcome, AppError> {
        let target = self.registry.get(name)?;
        let current = self.registry.active();

        let (reachable, server_version, error) = match target.client().await {
            Ok(client) => match probe(&client, self.probe_timeout).await {
                Ok(version) => (true, Some(version), None),
                Err(e) => (false, None, Some(e.to_string())),
            },
            Err(e) => (false, None, Some(e.to_string())),
        };
        if let Some(error) = &error {
            warn!("Context '{}' is not reachable: {}", name, error);
        }

        if !force && current.name() == name && Arc::ptr_eq(&current.context, &target) {
            return Ok(SwitchOutcome {
                context: current.name().to_string(),
                namespace: current.namespace().to_string(),
                previous: current.name().to_string(),
                generation: current.generation,
                switched: false,
                reachable,
                server_version,
                error,
                sessions_closed: 0,
                watches_resynced: 0,
                watches_closed: 0,
            });
        }

        let previous = self.registry.set_active(name)?;
        let active = self.registry.active();

        let sessions_closed = self.sessions.close_stale(active.generation, REASON_CONTEXT_CHANGED);
        let report = self.hub.invalidate_all(active.clone()).await;

        info!(
            "Switched context '{}' -> '{}' (generation {}, reachable: {})",
            previous.name(),
            active.name(),
            active.generation,
            reachable
        );

        Ok(SwitchOutcome {
            context: active.name().to_string(),
            namespace: active.namespace().to_string(),
            previous: previous.name().to_string(),
            generation: active.generation,
            switched: true,
            reachable,
            server_version,
            error,
            sessions_closed,
            watches_resynced: report.resynced,
            watches_closed: report.closed,
        })
    }
}
