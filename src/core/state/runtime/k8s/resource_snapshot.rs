use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health bucket a projected object falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Warning,
    Error,
}

/// Identity of one object: namespace+name, or name alone for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Lightweight projection of a Kubernetes object.
///
/// Only the status fields needed for summaries and listing are kept, never the
/// full object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Human-readable status ("Running", "2/3 ready", "Bound", ...)
    pub status: String,

    pub health: Health,

    /// Kind-specific columns (ready, restarts, node, type, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ResourceRecord {
    pub fn new(
        namespace: Option<String>,
        name: impl Into<String>,
        status: impl Into<String>,
        health: Health,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.filter(|ns| !ns.is_empty()),
            status: status.into(),
            health,
            details: BTreeMap::new(),
            created_at: None,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Derived view of a snapshot. Recomputed on every delta, never mutated by hand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub total: usize,
    pub healthy: usize,
    pub warning: usize,
    pub error: usize,
    pub items: Vec<ResourceRecord>,
}

/// Materialized state of one watch: the cumulative effect of every delta
/// observed since the watch was (re-)established.
///
/// Lives only in memory and is owned by exactly one watch task.
#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    objects: HashMap<ObjectKey, ResourceRecord>,
}

impl ResourceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from a complete initial listing.
    pub fn from_records(records: impl IntoIterator<Item = ResourceRecord>) -> Self {
        let objects = records.into_iter().map(|r| (r.key(), r)).collect();
        Self { objects }
    }

    /// Insert or replace the entry for one object.
    pub fn apply(&mut self, record: ResourceRecord) {
        self.objects.insert(record.key(), record);
    }

    /// Drop one object. Returns whether it was present.
    pub fn remove(&mut self, key: &ObjectKey) -> bool {
        self.objects.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&ResourceRecord> {
        self.objects.get(key)
    }

    /// Count health buckets and collect a stable, bounded sample of items.
    pub fn summarize(&self, sample_limit: usize) -> SummaryRecord {
        let mut summary = SummaryRecord {
            total: self.objects.len(),
            ..SummaryRecord::default()
        };

        for record in self.objects.values() {
            match record.health {
                Health::Healthy => summary.healthy += 1,
                Health::Warning => summary.warning += 1,
                Health::Error => summary.error += 1,
            }
        }

        let mut items: Vec<&ResourceRecord> = self.objects.values().collect();
        // Problems first, then by identity so the sample is deterministic.
        items.sort_by(|a, b| {
            severity(b.health)
                .cmp(&severity(a.health))
                .then_with(|| a.namespace.cmp(&b.namespace))
                .then_with(|| a.name.cmp(&b.name))
        });
        summary.items = items.into_iter().take(sample_limit).cloned().collect();

        summary
    }
}

fn severity(health: Health) -> u8 {
    match health {
        Health::Healthy => 0,
        Health::Warning => 1,
        Health::Error => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, health: Health) -> ResourceRecord {
        ResourceRecord::new(Some("default".into()), name, "Running", health)
    }

    #[test]
    fn test_apply_and_remove_track_true_object_set() {
        let mut snap = ResourceSnapshot::new();
        snap.apply(pod("a", Health::Healthy));
        snap.apply(pod("b", Health::Healthy));
        snap.apply(pod("a", Health::Error)); // update, not a new entry
        assert_eq!(snap.len(), 2);

        assert!(snap.remove(&ObjectKey::new(Some("default".into()), "a")));
        assert!(!snap.remove(&ObjectKey::new(Some("default".into()), "a")));
        assert_eq!(snap.len(), 1);
        assert!(snap.get(&ObjectKey::new(Some("default".into()), "b")).is_some());
    }

    #[test]
    fn test_same_name_in_different_namespaces_are_distinct() {
        let mut snap = ResourceSnapshot::new();
        snap.apply(ResourceRecord::new(Some("a".into()), "web", "Running", Health::Healthy));
        snap.apply(ResourceRecord::new(Some("b".into()), "web", "Running", Health::Healthy));
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn test_summarize_counts_and_sample_order() {
        let snap = ResourceSnapshot::from_records(vec![
            pod("ok-1", Health::Healthy),
            pod("ok-2", Health::Healthy),
            pod("slow", Health::Warning),
            pod("broken", Health::Error),
        ]);

        let summary = snap.summarize(2);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.healthy, 2);
        assert_eq!(summary.warning, 1);
        assert_eq!(summary.error, 1);
        assert_eq!(summary.items.len(), 2);
        assert_eq!(summary.items[0].name, "broken");
        assert_eq!(summary.items[1].name, "slow");
    }

    #[test]
    fn test_empty_summary() {
        let summary = ResourceSnapshot::new().summarize(10);
        assert_eq!(summary, SummaryRecord::default());
    }

    #[test]
    fn test_summary_wire_shape() {
        let snap = ResourceSnapshot::from_records(vec![pod("web", Health::Healthy)]);
        let value = serde_json::to_value(snap.summarize(10)).unwrap();
        assert_eq!(value["total"], 1);
        assert_eq!(value["healthy"], 1);
        assert_eq!(value["items"][0]["name"], "web");
        assert_eq!(value["items"][0]["health"], "healthy");
    }
}
