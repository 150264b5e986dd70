//! Per-kind capabilities (list, watch, project) selected by table lookup.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::ListParams;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::client::kube_resources::{
    CronJob, DaemonSet, Deployment, Job, Namespace, Node, PersistentVolume, PersistentVolumeClaim,
    Pod, ReplicaSet, Service, StatefulSet,
};
use crate::core::client::mappers;
use crate::core::client::watchers::{watch_deltas, DeltaStream};
use crate::core::state::runtime::k8s::resource_snapshot::ResourceRecord;
use crate::errors::AppError;

#[async_trait]
pub trait ResourceKind: Send + Sync {
    /// Canonical lowercase plural, e.g. `pods`.
    fn name(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str];

    fn namespaced(&self) -> bool;

    fn watch(&self, client: Client, namespace: Option<&str>) -> DeltaStream;

    async fn list(
        &self,
        client: Client,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceRecord>, AppError>;
}

type ApiFor<K> = fn(Client, Option<&str>) -> Api<K>;

/// Table entry for a typed k8s-openapi resource.
pub struct KubeKind<K> {
    name: &'static str,
    aliases: &'static [&'static str],
    namespaced: bool,
    api: ApiFor<K>,
    project: fn(&K) -> ResourceRecord,
}

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn cluster_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
where
    K: Resource,
    <K as Resource>::DynamicType: Default,
{
    Api::all(client)
}

impl<K> KubeKind<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    pub fn namespaced(
        name: &'static str,
        aliases: &'static [&'static str],
        project: fn(&K) -> ResourceRecord,
    ) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            name,
            aliases,
            namespaced: true,
            api: namespaced_api::<K>,
            project,
        }
    }

    pub fn cluster_scoped(
        name: &'static str,
        aliases: &'static [&'static str],
        project: fn(&K) -> ResourceRecord,
    ) -> Self {
        Self {
            name,
            aliases,
            namespaced: false,
            api: cluster_api::<K>,
            project,
        }
    }
}

#[async_trait]
impl<K> ResourceKind for KubeKind<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn aliases(&self) -> &'static [&'static str] {
        self.aliases
    }

    fn namespaced(&self) -> bool {
        self.namespaced
    }

    fn watch(&self, client: Client, namespace: Option<&str>) -> DeltaStream {
        watch_deltas((self.api)(client, namespace), self.project)
    }

    async fn list(
        &self,
        client: Client,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceRecord>, AppError> {
        let api = (self.api)(client, namespace);
        let list = api.list(&ListParams::default()).await?;

        debug!("Listed {} {}", list.items.len(), self.name);
        Ok(list.items.iter().map(self.project).collect())
    }
}

/// Lookup table from any accepted spelling to the kind's capabilities.
pub struct KindTable {
    kinds: HashMap<&'static str, Arc<dyn ResourceKind>>,
    aliases: HashMap<String, &'static str>,
}

impl KindTable {
    pub fn new(kinds: Vec<Arc<dyn ResourceKind>>) -> Self {
        let mut table = Self {
            kinds: HashMap::new(),
            aliases: HashMap::new(),
        };

        for kind in kinds {
            let name = kind.name();
            table.aliases.insert(name.to_string(), name);
            for alias in kind.aliases() {
                table.aliases.insert(alias.to_lowercase(), name);
            }
            table.kinds.insert(name, kind);
        }
        table
    }

    /// Every kind the dashboard streams.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(KubeKind::<Pod>::namespaced("pods", &["pod", "po"], mappers::project_pod)),
            Arc::new(KubeKind::<Deployment>::namespaced(
                "deployments",
                &["deployment", "deploy"],
                mappers::project_deployment,
            )),
            Arc::new(KubeKind::<StatefulSet>::namespaced(
                "statefulsets",
                &["statefulset", "sts"],
                mappers::project_statefulset,
            )),
            Arc::new(KubeKind::<DaemonSet>::namespaced(
                "daemonsets",
                &["daemonset", "ds"],
                mappers::project_daemonset,
            )),
            Arc::new(KubeKind::<ReplicaSet>::namespaced(
                "replicasets",
                &["replicaset", "rs"],
                mappers::project_replicaset,
            )),
            Arc::new(KubeKind::<Job>::namespaced("jobs", &["job"], mappers::project_job)),
            Arc::new(KubeKind::<CronJob>::namespaced(
                "cronjobs",
                &["cronjob", "cj"],
                mappers::project_cronjob,
            )),
            Arc::new(KubeKind::<Service>::namespaced(
                "services",
                &["service", "svc"],
                mappers::project_service,
            )),
            Arc::new(KubeKind::<PersistentVolumeClaim>::namespaced(
                "persistentvolumeclaims",
                &["persistentvolumeclaim", "pvc"],
                mappers::project_pvc,
            )),
            Arc::new(KubeKind::<Node>::cluster_scoped(
                "nodes",
                &["node", "no"],
                mappers::project_node,
            )),
            Arc::new(KubeKind::<Namespace>::cluster_scoped(
                "namespaces",
                &["namespace", "ns"],
                mappers::project_namespace,
            )),
            Arc::new(KubeKind::<PersistentVolume>::cluster_scoped(
                "persistentvolumes",
                &["persistentvolume", "pv"],
                mappers::project_pv,
            )),
        ])
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ResourceKind>, AppError> {
        self.aliases
            .get(&name.trim().to_lowercase())
            .and_then(|canonical| self.kinds.get(canonical))
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("unknown resource kind '{}'", name)))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.kinds.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for KindTable {
    fn default() -> Self {
        Self::standard()
    }
}
