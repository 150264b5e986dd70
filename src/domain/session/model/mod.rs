//! Interactive session types: exec frames, status and list entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame sent by the caller of an exec session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecInput {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
}

/// Frame sent to the caller of an exec session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecOutput {
    Output { data: String },
    Error { data: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    Exec,
    PortForward,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Active,
    Closed { reason: String },
    Errored { message: String },
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed { .. } | SessionStatus::Errored { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortPair {
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: Uuid,
    pub kind: SessionKind,
    pub context: String,
    pub namespace: String,
    pub pod: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionFilter {
    pub kind: Option<SessionKind>,
    pub namespace: Option<String>,
    pub pod: Option<String>,
}

impl SessionFilter {
    pub fn matches(&self, summary: &SessionSummary) -> bool {
        self.kind.map_or(true, |k| k == summary.kind)
            && self.namespace.as_deref().map_or(true, |ns| ns == summary.namespace)
            && self.pod.as_deref().map_or(true, |p| p == summary.pod)
    }
}
