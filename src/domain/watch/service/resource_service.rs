use std::sync::Arc;

use tracing::debug;

use crate::core::client::context_registry::ClusterRegistry;
use crate::core::client::resource_kinds::KindTable;
use crate::core::state::runtime::k8s::resource_snapshot::{ResourceSnapshot, SummaryRecord};
use crate::domain::watch::service::watch_hub::WatchHub;
use crate::errors::AppError;

/// One-shot summary reads for callers that do not want a stream.
pub struct ResourceService {
    hub: Arc<WatchHub>,
    kinds: Arc<KindTable>,
    registry: Arc<ClusterRegistry>,
    sample_limit: usize,
}

impl ResourceService {
    pub fn new(
        hub: Arc<WatchHub>,
        kinds: Arc<KindTable>,
        registry: Arc<ClusterRegistry>,
        sample_limit: usize,
    ) -> Self {
        Self {
            hub,
            kinds,
            registry,
            sample_limit,
        }
    }

    /// Served from a synced watch when one exists, otherwise from one list call.
    pub async fn summary(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Arc<SummaryRecord>, AppError> {
        let key = self.hub.key(kind, namespace)?;
        if let Some(summary) = self.hub.current(&key).await {
            return Ok(summary);
        }

        let kind = self.kinds.resolve(&key.kind)?;
        let active = self.registry.active();
        let client = active.context.client().await?;

        debug!("No synced watch for {}, listing on '{}'", key, active.name());
        let records = kind.list(client, key.namespace_filter()).await?;
        Ok(Arc::new(
            ResourceSnapshot::from_records(records).summarize(self.sample_limit),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::watchers::WatchDelta;
    use crate::core::state::runtime::k8s::resource_snapshot::Health;
    use crate::core::state::runtime::k8s::watch_state::WatchKey;
    use crate::test_support::{pod, test_registry, wait_for, watch_config, FakeWatchSource};

    fn service(source: &Arc<FakeWatchSource>) -> (ResourceService, Arc<WatchHub>) {
        let registry = test_registry(&["a"], "a");
        let kinds = Arc::new(KindTable::standard());
        let hub = WatchHub::new(source.clone(), registry.clone(), kinds.clone(), watch_config());
        (ResourceService::new(hub.clone(), kinds, registry, 100), hub)
    }

    #[tokio::test]
    async fn test_synced_watch_is_reused() {
        let source = FakeWatchSource::new();
        let (service, hub) = service(&source);
        let key = WatchKey::new("pods", "default");

        hub.acquire(&key);
        let feed = source.feed(0).await;
        feed.unbounded_send(Ok(WatchDelta::ListStarted)).unwrap();
        feed.unbounded_send(Ok(WatchDelta::Listed(pod("web", Health::Healthy)))).unwrap();
        feed.unbounded_send(Ok(WatchDelta::ListDone)).unwrap();
        wait_for(|| {
            let hub = hub.clone();
            let key = key.clone();
            async move { hub.current(&key).await.is_some() }
        })
        .await;

        let summary = service.summary("po", Some("default")).await.unwrap();
        assert_eq!(summary.total, 1);
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let source = FakeWatchSource::new();
        let (service, _) = service(&source);
        assert!(matches!(
            service.summary("widgets", None).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_fallback_surfaces_connect_error() {
        let source = FakeWatchSource::new();
        let (service, _) = service(&source);
        let result = service.summary("nodes", None).await;
        assert!(matches!(result, Err(AppError::ConnectError(_))));
        assert_eq!(source.opens(), 0);
    }
}
