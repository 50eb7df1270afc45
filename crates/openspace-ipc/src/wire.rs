//! Payloads exchanged with the terminal backend.
//!
//! The backend speaks camelCase JSON. Incoming payloads also accept the
//! snake_case spelling some backend builds used.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Backend-assigned identifier of a shell session. Opaque to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// UI-stable identifier of a terminal pane. Survives remounts of the same slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaneId(String);

impl PaneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PaneId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    #[serde(alias = "session_id")]
    pub session_id: SessionId,
    #[serde(default)]
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub session_id: SessionId,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub session_id: SessionId,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillRequest {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// A chunk of shell output, emitted on [`OUTPUT_EVENT`](crate::OUTPUT_EVENT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    #[serde(alias = "session_id")]
    pub session_id: SessionId,
    pub data: String,
}

/// Final event of a session, emitted on [`EXIT_EVENT`](crate::EXIT_EVENT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitEvent {
    #[serde(alias = "session_id")]
    pub session_id: SessionId,
    #[serde(alias = "exit_code")]
    pub exit_code: i32,
    #[serde(default)]
    pub signal: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_request_omits_unset_fields() {
        let request = CreateRequest {
            cwd: None,
            cols: 80,
            rows: 24,
            shell: None,
            args: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({ "cols": 80, "rows": 24 }));
    }

    #[test]
    fn test_create_response_accepts_snake_case() {
        let camel: CreateResponse =
            serde_json::from_value(json!({ "sessionId": "s1", "pid": 42 })).unwrap();
        let snake: CreateResponse =
            serde_json::from_value(json!({ "session_id": "s1", "pid": 42 })).unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.session_id.as_str(), "s1");
    }

    #[test]
    fn test_exit_event_signal_is_optional() {
        let event: ExitEvent =
            serde_json::from_value(json!({ "sessionId": "s1", "exitCode": -1 })).unwrap();
        assert_eq!(event.exit_code, -1);
        assert_eq!(event.signal, None);
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let request = WriteRequest {
            session_id: SessionId::new("abc"),
            data: "ls\n".into(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({ "sessionId": "abc", "data": "ls\n" }));
    }
}
