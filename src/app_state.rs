use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::client::context_registry::ClusterRegistry;
use crate::core::client::pods::PodConnector;
use crate::core::client::resource_kinds::KindTable;
use crate::core::client::watchers::WatchSource;
use crate::domain::cluster::service::switch_coordinator::SwitchCoordinator;
use crate::domain::session::service::session_manager::SessionManager;
use crate::domain::system::service::log_service::LogService;
use crate::domain::system::service::status_service::StatusService;
use crate::domain::watch::service::resource_service::ResourceService;
use crate::domain::watch::service::subscription_broker::SubscriptionBroker;
use crate::domain::watch::service::watch_hub::WatchHub;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ClusterRegistry>,
    pub kinds: Arc<KindTable>,
    pub broker: Arc<SubscriptionBroker>,
    pub sessions: Arc<SessionManager>,
    pub switcher: Arc<SwitchCoordinator>,
    pub resource_service: Arc<ResourceService>,
    pub status_service: Arc<StatusService>,
    pub log_service: Arc<LogService>,
    /// Depth of each push-stream subscriber's outbound queue.
    pub stream_buffer: usize,
}

/// Wire the engine together around the two cluster-facing seams.
pub fn build_app_state(
    config: &AppConfig,
    registry: Arc<ClusterRegistry>,
    kinds: Arc<KindTable>,
    source: Arc<dyn WatchSource>,
    connector: Arc<dyn PodConnector>,
) -> AppState {
    let hub = WatchHub::new(source, registry.clone(), kinds.clone(), config.watch.clone());
    let broker = SubscriptionBroker::new(hub.clone());
    let sessions = SessionManager::new(registry.clone(), connector, config.session.clone());
    let switcher = SwitchCoordinator::new(
        registry.clone(),
        hub.clone(),
        sessions.clone(),
        config.probe_timeout,
    );

    AppState {
        resource_service: Arc::new(ResourceService::new(
            hub,
            kinds.clone(),
            registry.clone(),
            config.watch.sample_limit,
        )),
        status_service: Arc::new(StatusService::new(
            registry.clone(),
            broker.clone(),
            sessions.clone(),
        )),
        log_service: Arc::new(LogService::new(config.log_dir.clone())),
        switcher: Arc::new(switcher),
        registry,
        kinds,
        broker,
        sessions,
        stream_buffer: config.watch.subscriber_buffer,
    }
}
