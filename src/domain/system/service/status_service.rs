use std::sync::Arc;

use serde::Serialize;

use crate::core::client::context_registry::ClusterRegistry;
use crate::domain::session::service::session_manager::SessionManager;
use crate::domain::watch::service::subscription_broker::SubscriptionBroker;
use crate::domain::watch::service::watch_hub::WatchKeyStatus;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub version: &'static str,
    pub context: String,
    pub namespace: String,
    pub generation: u64,
    pub watch_keys: usize,
    pub watches: Vec<WatchKeyStatus>,
    pub subscribers: usize,
    pub sessions: usize,
}

pub struct StatusService {
    registry: Arc<ClusterRegistry>,
    broker: Arc<SubscriptionBroker>,
    sessions: Arc<SessionManager>,
}

impl StatusService {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        broker: Arc<SubscriptionBroker>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            registry,
            broker,
            sessions,
        }
    }

    pub async fn status(&self) -> anyhow::Result<SystemStatus> {
        let active = self.registry.active();
        let watches = self.broker.hub().stats().await;

        Ok(SystemStatus {
            version: env!("CARGO_PKG_VERSION"),
            context: active.name().to_string(),
            namespace: active.namespace().to_string(),
            generation: active.generation,
            watch_keys: watches.len(),
            watches,
            subscribers: self.broker.subscriber_count(),
            sessions: self.sessions.len(),
        })
    }
}
