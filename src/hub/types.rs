//! Hub event and viewer types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Event kinds delivered to viewers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ConsoleOutput,
    UserJoined,
    UserLeft,
    CommandExecuted,
    Status,
}

/// One message for a viewer
///
/// Serializes as `{"type": ..., "payload": ..., "timestamp": ...}`; the
/// transport layer decides the wire encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl HubEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn console_output(server_id: &str, line: &str) -> Self {
        Self::new(
            EventKind::ConsoleOutput,
            json!({ "line": line, "server_id": server_id }),
        )
    }

    pub fn user_joined(viewer: &ViewerInfo) -> Self {
        Self::new(EventKind::UserJoined, viewer.to_payload())
    }

    pub fn user_left(viewer: &ViewerInfo) -> Self {
        Self::new(EventKind::UserLeft, viewer.to_payload())
    }

    pub fn command_executed(command: &str, user_id: i64, username: &str) -> Self {
        Self::new(
            EventKind::CommandExecuted,
            json!({ "command": command, "user_id": user_id, "username": username }),
        )
    }

    pub fn status(server_id: &str, status: &str) -> Self {
        Self::new(
            EventKind::Status,
            json!({ "server_id": server_id, "status": status }),
        )
    }

    /// `payload.line` for console output events
    pub fn line(&self) -> Option<&str> {
        self.payload.get("line").and_then(|v| v.as_str())
    }
}

/// Who is watching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerInfo {
    /// Per-connection id, unique across the hub
    pub client_id: String,
    pub user_id: i64,
    pub username: String,
}

impl ViewerInfo {
    /// New viewer with a fresh client id
    pub fn new(user_id: i64, username: impl Into<String>) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            username: username.into(),
        }
    }

    fn to_payload(&self) -> serde_json::Value {
        json!({
            "user_id": self.user_id,
            "username": self.username,
            "client_id": self.client_id,
        })
    }
}
