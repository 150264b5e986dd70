use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::state::runtime::k8s::resource_snapshot::SummaryRecord;
use crate::core::state::runtime::k8s::watch_state::{
    HubEvent, HubPayload, WatchKey, WatchPhase, WatchState,
};
use crate::domain::watch::service::watch_hub::{WatchEntry, WatchHub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEventType {
    Update,
    Error,
    Resync,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamData {
    Summary(Arc<SummaryRecord>),
    Message(String),
    Resync { context: String, generation: u64 },
}

/// One message of the resource push stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    pub resource: String,
    pub namespace: String,
    pub data: StreamData,
}

impl StreamEvent {
    fn from_payload(key: &WatchKey, payload: HubPayload) -> Self {
        let (event_type, data) = match payload {
            HubPayload::Update(summary) => (StreamEventType::Update, StreamData::Summary(summary)),
            HubPayload::Error(message) => (StreamEventType::Error, StreamData::Message(message)),
            HubPayload::Resync {
                context,
                generation,
            } => (
                StreamEventType::Resync,
                StreamData::Resync {
                    context,
                    generation,
                },
            ),
        };

        Self {
            event_type,
            resource: key.kind.clone(),
            namespace: key.namespace.clone(),
            data,
        }
    }

    /// What a subscriber joining now should see first.
    fn initial(key: &WatchKey, state: &WatchState) -> Option<Self> {
        match (state.phase, &state.summary, &state.last_error) {
            (WatchPhase::Synced, Some(summary), _) => {
                Some(Self::from_payload(key, HubPayload::Update(summary.clone())))
            }
            (WatchPhase::Error, _, Some(message)) => {
                Some(Self::from_payload(key, HubPayload::Error(message.clone())))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: Uuid,
    pub key: WatchKey,
}

struct Subscription {
    entry: Arc<WatchEntry>,
    cancel: CancellationToken,
}

/// Fans one watch per key out to any number of subscriber sinks.
pub struct SubscriptionBroker {
    hub: Arc<WatchHub>,
    subscriptions: DashMap<Uuid, Subscription>,
}

impl SubscriptionBroker {
    pub fn new(hub: Arc<WatchHub>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            subscriptions: DashMap::new(),
        })
    }

    pub fn hub(&self) -> &Arc<WatchHub> {
        &self.hub
    }

    /// Start delivering `key` into `sink`.
    ///
    /// The current summary is sent first, then every later event in order.
    /// Closing the sink's receiver unsubscribes.
    pub fn subscribe(self: &Arc<Self>, key: WatchKey, sink: mpsc::Sender<StreamEvent>) -> SubscriptionHandle {
        let entry = self.hub.acquire(&key);
        // Subscribe before the current state is read, so nothing falls in between.
        let events = entry.subscribe();

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.subscriptions.insert(
            id,
            Subscription {
                entry: entry.clone(),
                cancel: cancel.clone(),
            },
        );

        debug!("Subscriber {} attached to {}", id, key);
        tokio::spawn(Arc::clone(self).deliver(id, entry, events, sink, cancel));

        SubscriptionHandle { id, key }
    }

    /// Detach a subscriber. Safe to call repeatedly and from any task.
    pub fn unsubscribe(&self, id: &Uuid) -> bool {
        match self.subscriptions.remove(id) {
            Some((_, subscription)) => {
                subscription.cancel.cancel();
                self.hub.release(&subscription.entry);
                debug!("Subscriber {} detached from {}", id, subscription.entry.key);
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    async fn deliver(
        self: Arc<Self>,
        id: Uuid,
        entry: Arc<WatchEntry>,
        mut events: broadcast::Receiver<HubEvent>,
        sink: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        let key = entry.key.clone();
        // Last context generation this subscriber was told about.
        let mut generation = self.hub.active().generation;

        let state = entry.state().await;
        let mut delivered = state.revision;
        let mut alive = match StreamEvent::initial(&key, &state) {
            Some(event) => send(&sink, &cancel, event).await,
            None => true,
        };

        while alive {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sink.closed() => break,
                received = events.recv() => received,
            };

            alive = match received {
                Ok(event) if event.revision <= delivered => true,
                Ok(event) => {
                    delivered = event.revision;
                    if let HubPayload::Resync { generation: next, .. } = &event.payload {
                        generation = generation.max(*next);
                    }
                    send(&sink, &cancel, StreamEvent::from_payload(&key, event.payload)).await
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Too slow: skip the backlog and start over from the current summary.
                    warn!("Subscriber {} on {} lagged by {} event(s)", id, key, skipped);
                    let active = self.hub.active();
                    let mut sent = true;
                    if active.generation > generation {
                        // The skipped backlog held a context switch.
                        generation = active.generation;
                        let resync = HubPayload::Resync {
                            context: active.name().to_string(),
                            generation,
                        };
                        sent = send(&sink, &cancel, StreamEvent::from_payload(&key, resync)).await;
                    }

                    let state = entry.state().await;
                    delivered = state.revision;
                    match StreamEvent::initial(&key, &state) {
                        Some(event) if sent => send(&sink, &cancel, event).await,
                        _ => sent,
                    }
                }
                Err(RecvError::Closed) => false,
            };
        }

        self.unsubscribe(&id);
    }
}

/// Returns false when the subscriber is gone or cancelled.
async fn send(sink: &mpsc::Sender<StreamEvent>, cancel: &CancellationToken, event: StreamEvent) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = sink.send(event) => sent.is_ok(),
    }
}
