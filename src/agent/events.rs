//! Stream event definitions
//!
//! Defines the typed events pushed to subscribers. Every event serializes to
//! `{"type": ..., "timestamp": <epoch ms>, ...fields}`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single timestamped event in the output stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    /// The event payload
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Acknowledgement sent to a newly registered subscriber only
    Connected {
        /// The subscriber's client id
        id: String,
    },

    /// Model reasoning
    Thinking { content: String },

    /// Assistant text
    Message { content: String },

    /// The agent invoked a tool
    ToolUse {
        /// Tool name
        name: String,
        /// Tool input, passed through verbatim
        input: Value,
    },

    /// Output of a tool invocation, passed through verbatim
    ToolResult { content: Value },

    /// Lifecycle notice (e.g. "reset")
    Status {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// Something went wrong
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },

    /// The job's process exited successfully
    Completed,
}

impl StreamEvent {
    /// Wrap a payload with the current time
    pub fn now(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            kind,
        }
    }

    pub fn connected(id: impl Into<String>) -> Self {
        Self::now(EventKind::Connected { id: id.into() })
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::now(EventKind::Thinking {
            content: content.into(),
        })
    }

    pub fn message(content: impl Into<String>) -> Self {
        Self::now(EventKind::Message {
            content: content.into(),
        })
    }

    pub fn tool_use(name: impl Into<String>, input: Value) -> Self {
        Self::now(EventKind::ToolUse {
            name: name.into(),
            input,
        })
    }

    pub fn tool_result(content: Value) -> Self {
        Self::now(EventKind::ToolResult { content })
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self::now(EventKind::Status {
            status: status.into(),
            detail: None,
        })
    }

    pub fn status_with_detail(status: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::now(EventKind::Status {
            status: status.into(),
            detail: Some(detail.into()),
        })
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::now(EventKind::Error {
            error: error.into(),
            detail: None,
        })
    }

    pub fn error_with_detail(error: impl Into<String>, detail: Value) -> Self {
        Self::now(EventKind::Error {
            error: error.into(),
            detail: Some(detail),
        })
    }

    pub fn completed() -> Self {
        Self::now(EventKind::Completed)
    }

    /// The wire `type` tag, used as the SSE event name
    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::Connected { .. } => "connected",
            EventKind::Thinking { .. } => "thinking",
            EventKind::Message { .. } => "message",
            EventKind::ToolUse { .. } => "tool_use",
            EventKind::ToolResult { .. } => "tool_result",
            EventKind::Status { .. } => "status",
            EventKind::Error { .. } => "error",
            EventKind::Completed => "completed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_thinking_wire_shape() {
        let event = StreamEvent {
            timestamp: 42,
            kind: EventKind::Thinking {
                content: "hmm".to_string(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "thinking", "timestamp": 42, "content": "hmm"})
        );
    }

    #[test]
    fn test_completed_has_only_type_and_timestamp() {
        let event = StreamEvent {
            timestamp: 7,
            kind: EventKind::Completed,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "completed", "timestamp": 7}));
    }

    #[test]
    fn test_status_omits_missing_detail() {
        let value = serde_json::to_value(StreamEvent::status("reset")).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["status"], "reset");
        assert!(value.get("detail").is_none());
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_tool_use_input_passes_through() {
        let input = json!({"command": "ls -la", "nested": {"a": [1, 2]}});
        let value = serde_json::to_value(StreamEvent::tool_use("Bash", input.clone())).unwrap();
        assert_eq!(value["type"], "tool_use");
        assert_eq!(value["name"], "Bash");
        assert_eq!(value["input"], input);
    }

    #[test]
    fn test_error_with_detail() {
        let event = StreamEvent::error_with_detail("boom", json!({"exit_code": 1}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["error"], "boom");
        assert_eq!(value["detail"]["exit_code"], 1);
    }

    #[test]
    fn test_event_type_matches_serialized_tag() {
        let events = [
            StreamEvent::connected("abc"),
            StreamEvent::thinking("t"),
            StreamEvent::message("m"),
            StreamEvent::tool_use("Read", json!({})),
            StreamEvent::tool_result(json!("ok")),
            StreamEvent::status("reset"),
            StreamEvent::error("e"),
            StreamEvent::completed(),
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.event_type());
        }
    }

    #[test]
    fn test_deserialize_connected() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"connected","timestamp":1,"id":"client-1"}"#).unwrap();
        assert_eq!(
            event.kind,
            EventKind::Connected {
                id: "client-1".to_string()
            }
        );
    }
}
