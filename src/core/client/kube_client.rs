use std::sync::Arc;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::errors::AppError;

/// Where a context's connection parameters come from.
#[derive(Clone)]
pub enum ContextSource {
    /// A named context inside a (merged) kubeconfig.
    Kubeconfig(Arc<Kubeconfig>),
    /// A ready-made config, used for the in-cluster service account.
    Config(Config),
}

/// Creates a Kubernetes client for one context. No request is sent here;
/// an unreachable cluster only shows up on the first API call.
pub async fn build_kube_client(context: &str, source: &ContextSource) -> Result<Client, AppError> {
    let config = match source {
        ContextSource::Kubeconfig(kubeconfig) => {
            let options = KubeConfigOptions {
                context: Some(context.to_string()),
                cluster: None,
                user: None,
            };
            Config::from_custom_kubeconfig(kubeconfig.as_ref().clone(), &options)
                .await
                .map_err(|e| {
                    AppError::ConnectError(format!("invalid kubeconfig for context '{context}': {e}"))
                })?
        }
        ContextSource::Config(config) => config.clone(),
    };

    let client = Client::try_from(config).map_err(|e| {
        AppError::ConnectError(format!("failed to create client for '{context}': {e}"))
    })?;

    debug!("Kubernetes client initialized for context '{}'", context);
    Ok(client)
}

/// Cheap liveness check against `/version`, bounded by `timeout`.
pub async fn probe(client: &Client, timeout: Duration) -> Result<String, AppError> {
    match tokio::time::timeout(timeout, client.apiserver_version()).await {
        Ok(Ok(info)) => Ok(info.git_version),
        Ok(Err(e)) => Err(AppError::ConnectError(format!("cluster unreachable: {e}"))),
        Err(_) => Err(AppError::ConnectError(format!(
            "cluster did not answer within {}ms",
            timeout.as_millis()
        ))),
    }
}
