//! Request and response bodies
//!
//! Defines the JSON shapes of the HTTP API. Event frames on the SSE streams
//! use `StreamEvent` directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::agent::SessionSnapshot;

/// Maximum message length (1MB)
pub const MAX_MESSAGE_LENGTH: usize = 1024 * 1024;

/// Request validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid request body: {0}")]
    InvalidBody(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Body of `POST /chat`
///
/// `message` is kept as raw JSON so a wrong type is reported as a validation
/// error rather than a deserialization failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<Value>,
}

impl ChatRequest {
    #[allow(dead_code)]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(Value::String(message.into())),
        }
    }

    /// Validate and return the message text
    pub fn validate(&self) -> ProtocolResult<&str> {
        let message = match &self.message {
            None | Some(Value::Null) => {
                return Err(ProtocolError::ValidationError(
                    "message is required".to_string(),
                ))
            }
            Some(Value::String(message)) => message,
            Some(_) => {
                return Err(ProtocolError::ValidationError(
                    "message must be a string".to_string(),
                ))
            }
        };

        if message.trim().is_empty() {
            return Err(ProtocolError::ValidationError(
                "message cannot be empty".to_string(),
            ));
        }
        if message.len() > MAX_MESSAGE_LENGTH {
            return Err(ProtocolError::ValidationError(format!(
                "message exceeds maximum length of {} bytes",
                MAX_MESSAGE_LENGTH
            )));
        }

        Ok(message)
    }
}

/// Supervisor state as reported by `GET /status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Stopped,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: RunState,
    pub busy: bool,
    pub sessions: Vec<SessionSnapshot>,
    pub subscribers: usize,
    /// Seconds since the server started
    pub uptime: u64,
}

/// Body of `POST /reset`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub status: &'static str,
    pub session_id: Uuid,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl ResetResponse {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            status: "reset",
            session_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
