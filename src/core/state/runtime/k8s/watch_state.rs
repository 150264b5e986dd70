use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::core::state::runtime::k8s::resource_snapshot::SummaryRecord;

/// Identifies one logical watch: a kind plus a namespace, empty meaning
/// all namespaces (or a cluster-scoped kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WatchKey {
    pub kind: String,
    pub namespace: String,
}

impl WatchKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
        }
    }

    /// Namespace to hand to the API, `None` for all namespaces.
    pub fn namespace_filter(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(&self.namespace)
        }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/*", self.kind)
        } else {
            write!(f, "{}/{}", self.kind, self.namespace)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchPhase {
    Uninitialized,
    Establishing,
    Synced,
    Error,
    Closed,
}

/// What a watch tells its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum HubPayload {
    /// Full summary after a list completed or a delta was applied.
    Update(Arc<SummaryRecord>),
    /// The watch broke; it is being re-established.
    Error(String),
    /// The active context changed; a fresh `Update` follows once re-synced.
    Resync { context: String, generation: u64 },
}

/// One event of a watch, numbered in the order it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct HubEvent {
    pub revision: u64,
    pub payload: HubPayload,
}

/// Published state of one watch. Replaced as a whole on every change.
#[derive(Debug, Clone)]
pub struct WatchState {
    pub phase: WatchPhase,
    /// Revision of the last event emitted; survives re-establishment.
    pub revision: u64,
    /// Present only while `Synced`.
    pub summary: Option<Arc<SummaryRecord>>,
    pub last_error: Option<String>,
}

impl Default for WatchState {
    fn default() -> Self {
        Self {
            phase: WatchPhase::Uninitialized,
            revision: 0,
            summary: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_key_namespace_filter() {
        assert_eq!(WatchKey::new("pods", "default").namespace_filter(), Some("default"));
        assert_eq!(WatchKey::new("nodes", "").namespace_filter(), None);
        assert_eq!(WatchKey::new("nodes", "").to_string(), "nodes/*");
    }
}
