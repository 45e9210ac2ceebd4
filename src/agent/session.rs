//! Conversation bookkeeping
//!
//! A `Session` is the single conversation the supervisor drives. It owns the
//! continuation token reported by the agent and the one-job-at-a-time flag.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// State of the current conversation with the agent executable
#[derive(Debug, Clone)]
pub struct Session {
    /// Local identifier, regenerated on reset
    id: Uuid,
    /// Opaque token the agent reports, replayed to resume context
    continuation_token: Option<String>,
    /// Whether a job is in flight
    busy: bool,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session with no continuation token
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            continuation_token: None,
            busy: false,
            started_at: now,
            last_activity_at: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn continuation_token(&self) -> Option<&str> {
        self.continuation_token.as_deref()
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Claim the session for a job. Returns false if one is already in flight.
    pub fn begin_job(&mut self) -> bool {
        if self.busy {
            return false;
        }
        self.busy = true;
        self.touch();
        true
    }

    /// Release the session after a job ends
    pub fn end_job(&mut self) {
        self.busy = false;
        self.touch();
    }

    /// Record a token seen in agent output. Returns true if it changed.
    pub fn observe_token(&mut self, token: &str) -> bool {
        self.touch();
        if self.continuation_token.as_deref() == Some(token) {
            return false;
        }
        self.continuation_token = Some(token.to_string());
        true
    }

    /// Forget the conversation: drop the token and take a new local id
    pub fn reset(&mut self) {
        self.continuation_token = None;
        self.id = Uuid::new_v4();
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Point-in-time view for status reporting
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            started_at: self.started_at,
            last_activity: self.last_activity_at,
            continuation_token: self.continuation_token.clone(),
            busy: self.busy,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of a session, as reported by `/status`
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_token: Option<String>,
    pub busy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_new() {
        let session = Session::new();
        assert!(!session.is_busy());
        assert!(session.continuation_token().is_none());
        let snapshot = session.snapshot();
        assert_eq!(snapshot.started_at, snapshot.last_activity);
    }

    #[test]
    fn test_begin_job_is_exclusive() {
        let mut session = Session::new();
        assert!(session.begin_job());
        assert!(session.is_busy());
        assert!(!session.begin_job());
        session.end_job();
        assert!(!session.is_busy());
        assert!(session.begin_job());
    }

    #[test]
    fn test_observe_token() {
        let mut session = Session::new();
        assert!(session.observe_token("abc"));
        assert!(!session.observe_token("abc"));
        assert_eq!(session.continuation_token(), Some("abc"));
        assert!(session.observe_token("def"));
        assert_eq!(session.continuation_token(), Some("def"));
    }

    #[test]
    fn test_reset_clears_token_and_changes_id() {
        let mut session = Session::new();
        let old_id = session.id();
        session.observe_token("abc");
        session.reset();
        assert!(session.continuation_token().is_none());
        assert_ne!(session.id(), old_id);
    }

    #[test]
    fn test_snapshot_serialization() {
        let mut session = Session::new();
        session.observe_token("tok");
        let value = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(value["continuationToken"], "tok");
        assert_eq!(value["busy"], false);
        assert!(value["startedAt"].is_string());
        assert!(value["lastActivity"].is_string());
        assert_eq!(value["id"], session.id().to_string());
    }
}
