//! Context API DTOs

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::client::context_registry::{ActiveContext, ClusterContext};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextView {
    pub name: String,
    pub cluster: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    pub is_active: bool,
}

impl ContextView {
    pub fn new(context: &ClusterContext, active: &ActiveContext) -> Self {
        Self {
            name: context.name.clone(),
            cluster: context.cluster.clone(),
            user: context.user.clone(),
            namespace: context.namespace.clone(),
            server_url: context.server_url.clone(),
            is_active: context.name == active.name(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextListResponse {
    pub current: String,
    pub namespace: String,
    pub generation: u64,
    pub contexts: Vec<ContextView>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SwitchContextRequest {
    #[validate(length(min = 1))]
    pub context: String,
}
