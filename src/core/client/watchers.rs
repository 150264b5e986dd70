use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::runtime::watcher;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::client::context_registry::ActiveContext;
use crate::core::client::mappers::object_key;
use crate::core::client::resource_kinds::KindTable;
use crate::core::state::runtime::k8s::resource_snapshot::{ObjectKey, ResourceRecord};
use crate::core::state::runtime::k8s::watch_state::WatchKey;
use crate::errors::AppError;

/// One change observed on a watch, already projected.
///
/// `ListStarted`/`Listed`/`ListDone` bracket a (re-)list: the objects in
/// between form a complete replacement set and must be swapped in as a whole.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchDelta {
    ListStarted,
    Listed(ResourceRecord),
    ListDone,
    Applied(ResourceRecord),
    Deleted(ObjectKey),
}

pub type DeltaStream = BoxStream<'static, Result<WatchDelta, AppError>>;

/// Watch one kind through kube-runtime and project every event.
///
/// No backoff is applied here: the first error is surfaced so the caller can
/// drop the stream and decide how to re-establish it.
pub fn watch_deltas<K>(api: Api<K>, project: fn(&K) -> ResourceRecord) -> DeltaStream
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let watcher_config = watcher::Config::default();

    watcher(api, watcher_config)
        .map(move |event| match event {
            Ok(watcher::Event::Init) => Ok(WatchDelta::ListStarted),
            Ok(watcher::Event::InitApply(obj)) => Ok(WatchDelta::Listed(project(&obj))),
            Ok(watcher::Event::InitDone) => Ok(WatchDelta::ListDone),
            Ok(watcher::Event::Apply(obj)) => {
                debug!("Watch apply: {}", object_key(obj.meta()));
                Ok(WatchDelta::Applied(project(&obj)))
            }
            Ok(watcher::Event::Delete(obj)) => {
                debug!("Watch delete: {}", object_key(obj.meta()));
                Ok(WatchDelta::Deleted(object_key(obj.meta())))
            }
            Err(e) => Err(AppError::ConnectError(format!("watch failed: {e}"))),
        })
        .boxed()
}

/// Opens the underlying watch for a key against a captured active context.
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn open(&self, key: &WatchKey, active: &ActiveContext) -> Result<DeltaStream, AppError>;
}

pub struct KubeWatchSource {
    kinds: Arc<KindTable>,
}

impl KubeWatchSource {
    pub fn new(kinds: Arc<KindTable>) -> Self {
        Self { kinds }
    }
}

#[async_trait]
impl WatchSource for KubeWatchSource {
    async fn open(&self, key: &WatchKey, active: &ActiveContext) -> Result<DeltaStream, AppError> {
        let kind = self.kinds.resolve(&key.kind)?;
        let client = active.context.client().await?;

        debug!("Opening watch {} on context '{}'", key, active.name());
        Ok(kind.watch(client, key.namespace_filter()))
    }
}
