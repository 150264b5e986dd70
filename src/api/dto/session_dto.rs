//! Session API DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

pub const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Default, Deserialize)]
pub struct ExecQuery {
    pub container: Option<String>,
    /// Whitespace separated; defaults to a shell.
    pub command: Option<String>,
}

impl ExecQuery {
    pub fn command(&self) -> Vec<String> {
        let parts: Vec<String> = self
            .command
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if parts.is_empty() {
            vec![DEFAULT_SHELL.to_string()]
        } else {
            parts
        }
    }
}

/// First frame on an exec socket, before any output.
#[derive(Debug, Serialize)]
pub struct ExecSessionFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub id: Uuid,
}

impl ExecSessionFrame {
    pub fn new(id: Uuid) -> Self {
        Self {
            frame_type: "session",
            id,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardStartRequest {
    #[validate(length(min = 1))]
    pub namespace: String,
    #[validate(length(min = 1))]
    pub pod: String,
    /// Absent or 0 picks a free local port.
    pub local_port: Option<u16>,
    #[validate(range(min = 1))]
    pub remote_port: u16,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardStopRequest {
    #[validate(length(min = 1))]
    pub namespace: String,
    #[validate(length(min = 1))]
    pub pod: String,
    #[validate(range(min = 1))]
    pub local_port: u16,
    #[validate(range(min = 1))]
    pub remote_port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardStartResponse {
    pub session_id: Uuid,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardStopResponse {
    /// False when no matching tunnel was running.
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_command_defaults_to_shell() {
        assert_eq!(ExecQuery::default().command(), vec!["/bin/sh"]);

        let query = ExecQuery {
            container: None,
            command: Some("  ls  -la /tmp ".into()),
        };
        assert_eq!(query.command(), vec!["ls", "-la", "/tmp"]);
    }

    #[test]
    fn test_port_forward_request_validation() {
        let request: PortForwardStartRequest =
            serde_json::from_str(r#"{"namespace":"default","pod":"web-0","remotePort":0}"#).unwrap();
        assert!(request.validate().is_err());

        let request: PortForwardStartRequest =
            serde_json::from_str(r#"{"namespace":"default","pod":"web-0","remotePort":8080}"#).unwrap();
        assert!(request.validate().is_ok());
        assert!(request.local_port.is_none());
    }
}
