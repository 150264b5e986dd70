//! One watch per (kind, namespace), shared by every subscriber of that key.
//!
//! Each key owns a background task that opens the watch, keeps a
//! [`ResourceSnapshot`] and publishes a fresh summary after every delta.
//! Subscribers only read: they get the published [`WatchState`] and a
//! broadcast receiver whose bounded queue drops the oldest events when the
//! subscriber falls behind.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::core::client::context_registry::{ActiveContext, ClusterRegistry};
use crate::core::client::resource_kinds::KindTable;
use crate::core::client::watchers::{DeltaStream, WatchDelta, WatchSource};
use crate::core::state::runtime::k8s::resource_snapshot::{
    ResourceRecord, ResourceSnapshot, SummaryRecord,
};
use crate::core::state::runtime::k8s::watch_state::{
    HubEvent, HubPayload, WatchKey, WatchPhase, WatchState,
};
use crate::core::state::runtime::k8s::watch_state_repository::WatchStateRepository;
use crate::core::state::runtime::k8s::watch_state_repository_trait::WatchStateRepositoryTrait;
use crate::core::util::backoff::Backoff;
use crate::errors::AppError;

pub struct WatchEntry {
    pub key: WatchKey,
    events: broadcast::Sender<HubEvent>,
    state: WatchStateRepository,
    subscribers: AtomicUsize,
    idle_epoch: AtomicU64,
    task: Mutex<CancellationToken>,
}

impl WatchEntry {
    fn new(key: WatchKey, buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        Self {
            key,
            events,
            state: WatchStateRepository::new(),
            subscribers: AtomicUsize::new(0),
            idle_epoch: AtomicU64::new(0),
            task: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> Arc<WatchState> {
        self.state.get().await
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Install a token for a new task, cancelling the previous one.
    fn replace_task(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut guard = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, token.clone()).cancel();
        token
    }

    fn cancel_task(&self) {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    async fn set_phase(&self, owner: &CancellationToken, phase: WatchPhase) {
        self.state
            .update(|s| {
                if !owner.is_cancelled() {
                    s.phase = phase;
                }
            })
            .await;
    }

    /// Record and broadcast one event.
    ///
    /// The state write and the broadcast happen under the same lock, so a
    /// reader that saw revision `r` is guaranteed to receive every event
    /// after `r`. Events from a cancelled `owner` are dropped.
    async fn publish(&self, owner: Option<&CancellationToken>, phase: WatchPhase, payload: HubPayload) {
        let events = &self.events;
        self.state
            .update(|s| {
                if owner.is_some_and(CancellationToken::is_cancelled) {
                    return;
                }
                s.revision += 1;
                s.phase = phase;
                match &payload {
                    HubPayload::Update(summary) => {
                        s.summary = Some(summary.clone());
                        s.last_error = None;
                    }
                    HubPayload::Error(message) => {
                        s.summary = None;
                        s.last_error = Some(message.clone());
                    }
                    HubPayload::Resync { .. } => {
                        s.summary = None;
                        s.last_error = None;
                    }
                }
                // No receivers is fine.
                let _ = events.send(HubEvent {
                    revision: s.revision,
                    payload,
                });
            })
            .await;
    }

    async fn close(&self) {
        self.cancel_task();
        self.state
            .update(|s| {
                s.phase = WatchPhase::Closed;
                s.summary = None;
            })
            .await;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchKeyStatus {
    pub kind: String,
    pub namespace: String,
    pub phase: WatchPhase,
    pub subscribers: usize,
    pub revision: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvalidateReport {
    pub resynced: usize,
    pub closed: usize,
}

pub struct WatchHub {
    source: Arc<dyn WatchSource>,
    registry: Arc<ClusterRegistry>,
    kinds: Arc<KindTable>,
    config: WatchConfig,
    entries: DashMap<WatchKey, Arc<WatchEntry>>,
}

impl WatchHub {
    pub fn new(
        source: Arc<dyn WatchSource>,
        registry: Arc<ClusterRegistry>,
        kinds: Arc<KindTable>,
        config: WatchConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            registry,
            kinds,
            config,
            entries: DashMap::new(),
        })
    }

    /// Normalize a kind name and namespace into a key.
    ///
    /// Cluster-scoped kinds always get an empty namespace.
    pub fn key(&self, kind: &str, namespace: Option<&str>) -> Result<WatchKey, AppError> {
        let kind = self.kinds.resolve(kind)?;
        let namespace = if kind.namespaced() {
            namespace.map(str::trim).unwrap_or_default().to_string()
        } else {
            String::new()
        };
        Ok(WatchKey::new(kind.name(), namespace))
    }

    pub fn active(&self) -> Arc<ActiveContext> {
        self.registry.active()
    }

    /// Register interest in a key, starting its watch if none is running.
    pub fn acquire(&self, key: &WatchKey) -> Arc<WatchEntry> {
        // The count is bumped under the map's shard lock, so eviction can
        // never remove an entry that was just handed out.
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get().clone();
                entry.subscribers.fetch_add(1, Ordering::SeqCst);
                entry
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(WatchEntry::new(key.clone(), self.config.subscriber_buffer));
                entry.subscribers.fetch_add(1, Ordering::SeqCst);
                vacant.insert(entry.clone());

                info!("Starting watch {}", key);
                self.spawn(entry.clone(), self.registry.active());
                entry
            }
        }
    }

    /// Drop interest in an entry. The last release starts the idle grace period.
    pub fn release(self: &Arc<Self>, entry: &Arc<WatchEntry>) {
        let previous = entry
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous != Ok(1) {
            return;
        }

        let epoch = entry.idle_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let hub = Arc::clone(self);
        let entry = Arc::clone(entry);
        let grace = self.config.idle_grace;

        debug!("Watch {} idle, evicting in {:?}", entry.key, grace);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hub.evict_if_idle(&entry, epoch).await;
        });
    }

    async fn evict_if_idle(&self, entry: &Arc<WatchEntry>, epoch: u64) {
        let removed = self.entries.remove_if(&entry.key, |_, current| {
            Arc::ptr_eq(current, entry)
                && current.subscribers.load(Ordering::SeqCst) == 0
                && current.idle_epoch.load(Ordering::SeqCst) == epoch
        });

        if removed.is_some() {
            entry.close().await;
            info!("Closed idle watch {}", entry.key);
        }
    }

    /// Drop every watch bound to the previous context.
    ///
    /// Keys nobody subscribes to are closed. Keys with subscribers emit a
    /// `Resync` event and are re-established under `active`.
    pub async fn invalidate_all(&self, active: Arc<ActiveContext>) -> InvalidateReport {
        let mut report = InvalidateReport::default();
        let entries: Vec<Arc<WatchEntry>> = self.entries.iter().map(|e| e.value().clone()).collect();

        for entry in entries {
            let idle = self.entries.remove_if(&entry.key, |_, current| {
                Arc::ptr_eq(current, &entry) && current.subscribers.load(Ordering::SeqCst) == 0
            });
            if idle.is_some() {
                entry.close().await;
                report.closed += 1;
                continue;
            }

            entry.cancel_task();
            entry
                .publish(
                    None,
                    WatchPhase::Establishing,
                    HubPayload::Resync {
                        context: active.name().to_string(),
                        generation: active.generation,
                    },
                )
                .await;
            self.spawn(entry, active.clone());
            report.resynced += 1;
        }

        info!(
            "Watches invalidated for context '{}': {} resynced, {} closed",
            active.name(),
            report.resynced,
            report.closed
        );
        report
    }

    pub fn entry(&self, key: &WatchKey) -> Option<Arc<WatchEntry>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Summary of a key whose watch is currently synced.
    pub async fn current(&self, key: &WatchKey) -> Option<Arc<SummaryRecord>> {
        let entry = self.entry(key)?;
        let state = entry.state().await;
        match state.phase {
            WatchPhase::Synced => state.summary.clone(),
            _ => None,
        }
    }

    pub async fn stats(&self) -> Vec<WatchKeyStatus> {
        let entries: Vec<Arc<WatchEntry>> = self.entries.iter().map(|e| e.value().clone()).collect();

        let mut stats = Vec::with_capacity(entries.len());
        for entry in entries {
            let state = entry.state().await;
            stats.push(WatchKeyStatus {
                kind: entry.key.kind.clone(),
                namespace: entry.key.namespace.clone(),
                phase: state.phase,
                subscribers: entry.subscriber_count(),
                revision: state.revision,
                last_error: state.last_error.clone(),
            });
        }
        stats.sort_by(|a, b| (&a.kind, &a.namespace).cmp(&(&b.kind, &b.namespace)));
        stats
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn spawn(&self, entry: Arc<WatchEntry>, active: Arc<ActiveContext>) {
        let token = entry.replace_task();
        let task = WatchTask {
            source: self.source.clone(),
            registry: self.registry.clone(),
            entry,
            active,
            token,
            config: self.config.clone(),
        };
        tokio::spawn(task.run());
    }
}

struct WatchTask {
    source: Arc<dyn WatchSource>,
    registry: Arc<ClusterRegistry>,
    entry: Arc<WatchEntry>,
    active: Arc<ActiveContext>,
    token: CancellationToken,
    config: WatchConfig,
}

impl WatchTask {
    async fn run(self) {
        let key = &self.entry.key;
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);

        loop {
            if self.is_stale() {
                debug!("Watch task for {} is stale, exiting", key);
                return;
            }
            self.entry.set_phase(&self.token, WatchPhase::Establishing).await;

            let opened = tokio::select! {
                _ = self.token.cancelled() => return,
                opened = self.source.open(key, &self.active) => opened,
            };

            let failure = match opened {
                Ok(stream) => match self.pump(stream, &mut backoff).await {
                    Some(err) => err,
                    None => return,
                },
                Err(err) => err,
            };
            if self.token.is_cancelled() {
                return;
            }

            let delay = backoff.next_delay();
            warn!(
                "Watch {} failed (attempt {}): {}; retrying in {:?}",
                key,
                backoff.attempts(),
                failure,
                delay
            );
            self.entry
                .publish(Some(&self.token), WatchPhase::Error, HubPayload::Error(failure.to_string()))
                .await;

            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Apply deltas until the stream fails. Returns `None` when the task was
    /// cancelled or went stale.
    async fn pump(&self, mut stream: DeltaStream, backoff: &mut Backoff) -> Option<AppError> {
        let mut snapshot = ResourceSnapshot::new();
        // Objects of an in-progress (re-)list, swapped in on ListDone.
        let mut staged: Option<Vec<ResourceRecord>> = None;
        let mut synced = false;

        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return None,
                next = stream.next() => next,
            };
            let delta = match next {
                Some(Ok(delta)) => delta,
                Some(Err(err)) => return Some(err),
                None => return Some(AppError::ConnectError("watch stream ended".into())),
            };
            if self.is_stale() {
                return None;
            }

            match delta {
                WatchDelta::ListStarted => staged = Some(Vec::new()),
                WatchDelta::Listed(record) | WatchDelta::Applied(record) => match staged.as_mut() {
                    Some(staged) => staged.push(record),
                    None => {
                        snapshot.apply(record);
                        if synced {
                            self.publish_summary(&snapshot).await;
                        }
                    }
                },
                WatchDelta::Deleted(object) => match staged.as_mut() {
                    Some(staged) => staged.retain(|r| r.key() != object),
                    None => {
                        snapshot.remove(&object);
                        if synced {
                            self.publish_summary(&snapshot).await;
                        }
                    }
                },
                WatchDelta::ListDone => {
                    snapshot = ResourceSnapshot::from_records(staged.take().unwrap_or_default());
                    synced = true;
                    backoff.reset();

                    debug!("Watch {} synced with {} object(s)", self.entry.key, snapshot.len());
                    self.publish_summary(&snapshot).await;
                }
            }
        }
    }

    async fn publish_summary(&self, snapshot: &ResourceSnapshot) {
        let summary = Arc::new(snapshot.summarize(self.config.sample_limit));
        self.entry
            .publish(Some(&self.token), WatchPhase::Synced, HubPayload::Update(summary))
            .await;
    }

    fn is_stale(&self) -> bool {
        self.token.is_cancelled() || self.registry.generation() != self.active.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::runtime::k8s::resource_snapshot::Health;
    use crate::test_support::{
        next_event, pod, test_registry, wait_until, watch_config, FakeWatchSource,
    };

    fn hub(source: &Arc<FakeWatchSource>) -> (Arc<WatchHub>, Arc<ClusterRegistry>) {
        let registry = test_registry(&["a", "b"], "a");
        let hub = WatchHub::new(
            source.clone(),
            registry.clone(),
            Arc::new(KindTable::standard()),
            watch_config(),
        );
        (hub, registry)
    }

    fn expect_update(event: HubEvent) -> Arc<SummaryRecord> {
        match event.payload {
            HubPayload::Update(summary) => summary,
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_key_normalizes_kind_and_scope() {
        let source = FakeWatchSource::new();
        let (hub, _) = hub(&source);

        assert_eq!(hub.key("Pod", Some("default")).unwrap(), WatchKey::new("pods", "default"));
        assert_eq!(hub.key("nodes", Some("default")).unwrap(), WatchKey::new("nodes", ""));
        assert!(matches!(hub.key("gadgets", None), Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_many_subscribers_share_one_watch() {
        let source = FakeWatchSource::new();
        let (hub, _) = hub(&source);
        let key = WatchKey::new("pods", "default");

        let entries: Vec<_> = (0..10).map(|_| hub.acquire(&key)).collect();
        source.feed(0).await;

        assert_eq!(source.opens(), 1);
        assert_eq!(hub.len(), 1);
        assert_eq!(entries[0].subscriber_count(), 10);
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
    }

    #[tokio::test]
    async fn test_deltas_drive_summary() {
        let source = FakeWatchSource::new();
        let (hub, _) = hub(&source);
        let key = WatchKey::new("pods", "default");

        let entry = hub.acquire(&key);
        let mut rx = entry.subscribe();
        let feed = source.feed(0).await;

        feed.unbounded_send(Ok(WatchDelta::ListStarted)).unwrap();
        feed.unbounded_send(Ok(WatchDelta::ListDone)).unwrap();
        let summary = expect_update(next_event(&mut rx).await);
        assert_eq!(summary.total, 0);

        feed.unbounded_send(Ok(WatchDelta::Applied(pod("web", Health::Healthy)))).unwrap();
        let summary = expect_update(next_event(&mut rx).await);
        assert_eq!((summary.total, summary.healthy), (1, 1));
        assert_eq!(summary.items[0].name, "web");

        feed.unbounded_send(Ok(WatchDelta::Deleted(pod("web", Health::Healthy).key())))
            .unwrap();
        let summary = expect_update(next_event(&mut rx).await);
        assert_eq!(summary.total, 0);

        assert_eq!(hub.current(&key).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_relist_replaces_snapshot_atomically() {
        let source = FakeWatchSource::new();
        let (hub, _) = hub(&source);
        let entry = hub.acquire(&WatchKey::new("pods", ""));
        let mut rx = entry.subscribe();
        let feed = source.feed(0).await;

        feed.unbounded_send(Ok(WatchDelta::ListStarted)).unwrap();
        feed.unbounded_send(Ok(WatchDelta::Listed(pod("old", Health::Healthy)))).unwrap();
        feed.unbounded_send(Ok(WatchDelta::ListDone)).unwrap();
        assert_eq!(expect_update(next_event(&mut rx).await).total, 1);

        // Re-list without "old": it must not survive, and nothing partial is published.
        feed.unbounded_send(Ok(WatchDelta::ListStarted)).unwrap();
        feed.unbounded_send(Ok(WatchDelta::Listed(pod("new-1", Health::Healthy)))).unwrap();
        feed.unbounded_send(Ok(WatchDelta::Listed(pod("new-2", Health::Error)))).unwrap();
        feed.unbounded_send(Ok(WatchDelta::ListDone)).unwrap();

        let summary = expect_update(next_event(&mut rx).await);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.error, 1);
        assert!(summary.items.iter().all(|r| r.name != "old"));
    }

    #[tokio::test]
    async fn test_stream_failure_reports_error_then_resyncs() {
        let source = FakeWatchSource::new();
        let (hub, _) = hub(&source);
        let entry = hub.acquire(&WatchKey::new("pods", "default"));
        let mut rx = entry.subscribe();

        let feed = source.feed(0).await;
        feed.unbounded_send(Ok(WatchDelta::ListStarted)).unwrap();
        feed.unbounded_send(Ok(WatchDelta::ListDone)).unwrap();
        expect_update(next_event(&mut rx).await);

        feed.close_channel();
        let event = next_event(&mut rx).await;
        assert!(matches!(event.payload, HubPayload::Error(_)));
        assert_eq!(entry.state().await.phase, WatchPhase::Error);

        let feed = source.feed(1).await;
        feed.unbounded_send(Ok(WatchDelta::ListStarted)).unwrap();
        feed.unbounded_send(Ok(WatchDelta::Listed(pod("web", Health::Healthy)))).unwrap();
        feed.unbounded_send(Ok(WatchDelta::ListDone)).unwrap();

        let summary = expect_update(next_event(&mut rx).await);
        assert_eq!(summary.total, 1);
        assert_eq!(entry.state().await.phase, WatchPhase::Synced);
    }

    #[tokio::test]
    async fn test_failed_establishment_is_retried_without_trigger() {
        let source = FakeWatchSource::new();
        source.fail_next_opens(2);
        let (hub, _) = hub(&source);
        let entry = hub.acquire(&WatchKey::new("nodes", ""));
        let mut rx = entry.subscribe();

        assert!(matches!(next_event(&mut rx).await.payload, HubPayload::Error(_)));
        assert!(matches!(next_event(&mut rx).await.payload, HubPayload::Error(_)));

        let feed = source.feed(0).await;
        assert_eq!(source.opens(), 3);
        feed.unbounded_send(Ok(WatchDelta::ListStarted)).unwrap();
        feed.unbounded_send(Ok(WatchDelta::ListDone)).unwrap();
        expect_update(next_event(&mut rx).await);
    }

    #[tokio::test]
    async fn test_idle_key_is_evicted_after_grace() {
        let source = FakeWatchSource::new();
        let (hub, _) = hub(&source);
        let key = WatchKey::new("pods", "default");

        let entry = hub.acquire(&key);
        source.feed(0).await;
        hub.release(&entry);

        wait_until(|| hub.is_empty()).await;
        assert_eq!(entry.state().await.phase, WatchPhase::Closed);

        hub.acquire(&key);
        source.feed(1).await;
        assert_eq!(source.opens(), 2);
    }

    #[tokio::test]
    async fn test_resubscribe_within_grace_keeps_watch() {
        let source = FakeWatchSource::new();
        let (hub, _) = hub(&source);
        let key = WatchKey::new("pods", "default");

        let entry = hub.acquire(&key);
        source.feed(0).await;
        hub.release(&entry);
        let again = hub.acquire(&key);

        tokio::time::sleep(watch_config().idle_grace * 3).await;
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(hub.len(), 1);
        assert_eq!(source.opens(), 1);

        // Extra releases never underflow.
        hub.release(&again);
        hub.release(&again);
        assert_eq!(again.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_all_resyncs_live_keys_and_closes_idle_ones() {
        let source = FakeWatchSource::new();
        let (hub, registry) = hub(&source);

        let live = hub.acquire(&WatchKey::new("pods", "default"));
        let mut rx = live.subscribe();
        let feed = source.feed(0).await;
        feed.unbounded_send(Ok(WatchDelta::ListStarted)).unwrap();
        feed.unbounded_send(Ok(WatchDelta::ListDone)).unwrap();
        expect_update(next_event(&mut rx).await);

        let idle = hub.acquire(&WatchKey::new("nodes", ""));
        source.feed(1).await;
        idle.subscribers.store(0, Ordering::SeqCst);

        registry.set_active("b").unwrap();
        let report = hub.invalidate_all(registry.active()).await;
        assert_eq!(report, InvalidateReport { resynced: 1, closed: 1 });

        match next_event(&mut rx).await.payload {
            HubPayload::Resync { context, generation } => {
                assert_eq!(context, "b");
                assert_eq!(generation, 2);
            }
            other => panic!("expected resync, got {:?}", other),
        }
        assert_eq!(idle.state().await.phase, WatchPhase::Closed);
        assert!(hub.entry(&WatchKey::new("nodes", "")).is_none());

        // The old stream is ignored; the re-established one drives the key.
        let _ = feed.unbounded_send(Ok(WatchDelta::Applied(pod("stale", Health::Healthy))));
        let feed = source.feed(2).await;
        assert_eq!(source.last_context().as_deref(), Some("b"));
        feed.unbounded_send(Ok(WatchDelta::ListStarted)).unwrap();
        feed.unbounded_send(Ok(WatchDelta::ListDone)).unwrap();

        let summary = expect_update(next_event(&mut rx).await);
        assert_eq!(summary.total, 0);
        assert_eq!(live.state().await.phase, WatchPhase::Synced);
    }
}
