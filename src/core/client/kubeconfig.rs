//! Discovery of the contexts this process can talk to.

use std::collections::HashMap;
use std::sync::Arc;

use kube::config::Kubeconfig;
use kube::Config;
use tracing::{info, warn};

use crate::core::client::kube_client::ContextSource;
use crate::errors::AppError;

pub const IN_CLUSTER_CONTEXT: &str = "in-cluster";

/// Connection parameters for one context, as discovered.
#[derive(Clone)]
pub struct ContextSpec {
    pub name: String,
    pub cluster: String,
    pub user: Option<String>,
    pub namespace: Option<String>,
    pub server_url: Option<String>,
    /// Changes whenever any parameter that affects the client changes.
    pub fingerprint: String,
    pub source: ContextSource,
}

pub struct Discovered {
    pub contexts: Vec<ContextSpec>,
    pub current: Option<String>,
}

/// Read the merged kubeconfig, falling back to the in-cluster service account.
pub fn discover() -> Result<Discovered, AppError> {
    match Kubeconfig::read() {
        Ok(kubeconfig) => {
            let discovered = from_kubeconfig(kubeconfig);
            info!("kubeconfig: {} context(s) discovered", discovered.contexts.len());
            Ok(discovered)
        }
        Err(kubeconfig_err) => {
            warn!("kubeconfig not readable ({}), trying in-cluster config", kubeconfig_err);
            let config = Config::incluster().map_err(|e| {
                AppError::ConnectError(format!(
                    "no kubeconfig ({kubeconfig_err}) and no in-cluster config ({e})"
                ))
            })?;
            Ok(Discovered {
                contexts: vec![in_cluster(config)],
                current: Some(IN_CLUSTER_CONTEXT.to_string()),
            })
        }
    }
}

pub fn from_kubeconfig(kubeconfig: Kubeconfig) -> Discovered {
    let current = kubeconfig.current_context.clone();

    let clusters: HashMap<&str, String> = kubeconfig
        .clusters
        .iter()
        .map(|nc| (nc.name.as_str(), serde_json::to_string(nc).unwrap_or_default()))
        .collect();
    let servers: HashMap<&str, String> = kubeconfig
        .clusters
        .iter()
        .filter_map(|nc| Some((nc.name.as_str(), nc.cluster.as_ref()?.server.clone()?)))
        .collect();
    let users: HashMap<&str, String> = kubeconfig
        .auth_infos
        .iter()
        .map(|na| (na.name.as_str(), serde_json::to_string(na).unwrap_or_default()))
        .collect();

    let shared = Arc::new(kubeconfig.clone());

    let mut contexts: Vec<ContextSpec> = kubeconfig
        .contexts
        .iter()
        .filter_map(|named| {
            let ctx = named.context.as_ref()?;
            let user_entry = ctx
                .user
                .as_deref()
                .and_then(|u| users.get(u))
                .cloned()
                .unwrap_or_default();
            let fingerprint = format!(
                "{}|{}|{}",
                serde_json::to_string(named).unwrap_or_default(),
                clusters.get(ctx.cluster.as_str()).cloned().unwrap_or_default(),
                user_entry
            );

            Some(ContextSpec {
                name: named.name.clone(),
                cluster: ctx.cluster.clone(),
                user: ctx.user.clone(),
                namespace: ctx.namespace.clone(),
                server_url: servers.get(ctx.cluster.as_str()).cloned(),
                fingerprint,
                source: ContextSource::Kubeconfig(shared.clone()),
            })
        })
        .collect();
    contexts.sort_by(|a, b| a.name.cmp(&b.name));

    Discovered { contexts, current }
}

fn in_cluster(config: Config) -> ContextSpec {
    let server_url = config.cluster_url.to_string();
    ContextSpec {
        name: IN_CLUSTER_CONTEXT.to_string(),
        cluster: IN_CLUSTER_CONTEXT.to_string(),
        user: None,
        namespace: Some(config.default_namespace.clone()),
        fingerprint: server_url.clone(),
        server_url: Some(server_url),
        source: ContextSource::Config(config),
    }
}

/// Pick the context to activate at startup.
pub fn initial_context(discovered: &Discovered, requested: Option<&str>) -> Result<String, AppError> {
    let known = |name: &str| discovered.contexts.iter().any(|c| c.name == name);

    if let Some(name) = requested {
        return if known(name) {
            Ok(name.to_string())
        } else {
            Err(AppError::NotFound(format!("context '{name}' not found")))
        };
    }

    discovered
        .current
        .as_deref()
        .filter(|name| known(name))
        .or_else(|| discovered.contexts.first().map(|c| c.name.as_str()))
        .map(str::to_string)
        .ok_or_else(|| AppError::NotFound("no usable cluster context".into()))
}
