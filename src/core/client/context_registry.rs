use std::sync::Arc;

use dashmap::DashMap;
use kube::Client;
use serde::Serialize;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info};

use crate::core::client::kube_client::{build_kube_client, ContextSource};
use crate::core::client::kubeconfig::ContextSpec;
use crate::errors::{internal_error, AppError};

const DEFAULT_NAMESPACE: &str = "default";

/// One known context. Never mutated; a reload replaces it wholesale.
pub struct ClusterContext {
    pub name: String,
    pub cluster: String,
    pub user: Option<String>,
    pub namespace: String,
    pub server_url: Option<String>,
    fingerprint: String,
    source: ContextSource,
    client: OnceCell<Client>,
}

impl ClusterContext {
    pub fn from_spec(spec: ContextSpec) -> Self {
        Self {
            namespace: spec
                .namespace
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            name: spec.name,
            cluster: spec.cluster,
            user: spec.user,
            server_url: spec.server_url,
            fingerprint: spec.fingerprint,
            source: spec.source,
            client: OnceCell::new(),
        }
    }

    /// Client for this context, built on first use and cached afterwards.
    pub async fn client(&self) -> Result<Client, AppError> {
        self.client
            .get_or_try_init(|| build_kube_client(&self.name, &self.source))
            .await
            .cloned()
    }
}

/// The process-wide active context, captured as one immutable value.
///
/// `generation` increases on every switch, so work started under an older
/// value can tell it has gone stale.
pub struct ActiveContext {
    pub context: Arc<ClusterContext>,
    pub generation: u64,
}

impl ActiveContext {
    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn namespace(&self) -> &str {
        &self.context.namespace
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub replaced: Vec<String>,
    pub removed: Vec<String>,
}

pub struct ClusterRegistry {
    contexts: DashMap<String, Arc<ClusterContext>>,
    active: watch::Sender<Arc<ActiveContext>>,
}

impl ClusterRegistry {
    pub fn new(specs: Vec<ContextSpec>, initial: &str) -> Result<Self, AppError> {
        let contexts = DashMap::new();
        for spec in specs {
            contexts.insert(spec.name.clone(), Arc::new(ClusterContext::from_spec(spec)));
        }

        let context = contexts
            .get(initial)
            .map(|c| c.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("context '{initial}' not found")))?;
        let (active, _) = watch::channel(Arc::new(ActiveContext {
            context,
            generation: 1,
        }));

        info!("Cluster registry ready, active context '{}'", initial);
        Ok(Self { contexts, active })
    }

    pub fn get(&self, name: &str) -> Result<Arc<ClusterContext>, AppError> {
        self.contexts
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("context '{name}' not found")))
    }

    pub async fn client_for(&self, name: &str) -> Result<Client, AppError> {
        self.get(name)?.client().await
    }

    /// Consistent view of the active context. Cheap; take it once per operation.
    pub fn active(&self) -> Arc<ActiveContext> {
        self.active.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.active.borrow().generation
    }

    /// Point the process at another context and return what was active before.
    pub fn set_active(&self, name: &str) -> Result<Arc<ActiveContext>, AppError> {
        let context = self.get(name)?;

        let mut previous = None;
        self.active.send_modify(|current| {
            let next = Arc::new(ActiveContext {
                context,
                generation: current.generation + 1,
            });
            previous = Some(std::mem::replace(current, next));
        });

        let previous = previous.ok_or_else(|| internal_error("active context swap did not run"))?;
        debug!(
            "Active context '{}' -> '{}' (generation {})",
            previous.name(),
            name,
            previous.generation + 1
        );
        Ok(previous)
    }

    /// All contexts sorted by name.
    pub fn contexts(&self) -> Vec<Arc<ClusterContext>> {
        let mut all: Vec<_> = self.contexts.iter().map(|c| c.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Merge a fresh discovery into the registry.
    ///
    /// Unchanged contexts keep their cached client. The active context is
    /// never removed, even when it vanished from the source.
    pub fn replace_contexts(&self, specs: Vec<ContextSpec>) -> ReloadSummary {
        let active = self.active().name().to_string();
        let mut summary = ReloadSummary::default();
        let incoming: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();

        for spec in specs {
            let changed = match self.contexts.get(&spec.name) {
                Some(existing) if existing.fingerprint == spec.fingerprint => continue,
                Some(_) => true,
                None => false,
            };
            let name = spec.name.clone();
            self.contexts
                .insert(name.clone(), Arc::new(ClusterContext::from_spec(spec)));
            if changed {
                summary.replaced.push(name);
            } else {
                summary.added.push(name);
            }
        }

        self.contexts.retain(|name, _| {
            let keep = name == &active || incoming.contains(name);
            if !keep {
                summary.removed.push(name.clone());
            }
            keep
        });

        summary.added.sort();
        summary.replaced.sort();
        summary.removed.sort();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context_spec;

    fn registry() -> ClusterRegistry {
        ClusterRegistry::new(vec![context_spec("a"), context_spec("b")], "a").unwrap()
    }

    #[test]
    fn test_unknown_initial_context() {
        let result = ClusterRegistry::new(vec![context_spec("a")], "z");
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_set_active_returns_previous_and_bumps_generation() {
        let registry = registry();
        assert_eq!(registry.generation(), 1);

        let previous = registry.set_active("b").unwrap();
        assert_eq!(previous.name(), "a");
        assert_eq!(registry.active().name(), "b");
        assert_eq!(registry.generation(), 2);

        assert!(matches!(registry.set_active("nope"), Err(AppError::NotFound(_))));
        assert_eq!(registry.active().name(), "b");
    }

    #[test]
    fn test_captured_snapshot_is_not_torn_by_switch() {
        let registry = registry();
        let captured = registry.active();
        registry.set_active("b").unwrap();
        assert_eq!(captured.name(), "a");
        assert_eq!(captured.generation, 1);
    }

    #[tokio::test]
    async fn test_client_is_cached_per_context() {
        let registry = registry();
        assert!(registry.client_for("a").await.is_ok());
        assert!(registry.get("a").unwrap().client.initialized());
        assert!(!registry.get("b").unwrap().client.initialized());
        assert!(matches!(
            registry.client_for("zzz").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replace_contexts() {
        let registry = registry();
        registry.client_for("a").await.unwrap();

        let mut changed_b = context_spec("b");
        changed_b.fingerprint = "moved".into();
        let summary = registry.replace_contexts(vec![changed_b, context_spec("c")]);

        assert_eq!(summary.added, vec!["c".to_string()]);
        assert_eq!(summary.replaced, vec!["b".to_string()]);
        // "a" vanished from the source but is active.
        assert!(summary.removed.is_empty());
        assert!(registry.get("a").unwrap().client.initialized());

        registry.set_active("c").unwrap();
        let summary = registry.replace_contexts(vec![context_spec("c")]);
        assert_eq!(summary.removed, vec!["a".to_string(), "b".to_string()]);
    }
}
