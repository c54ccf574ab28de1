//! Mailbox entry data model.
//!
//! One entry = one JSON file named `<id>.json` in the watched directory.
//! The producer writes it once at creation; the consumer rewrites it once at
//! the terminal state and deletes it after the grace period.  A strict
//! producer→consumer handoff — the file is never written by both at once.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── ActionStatus ─────────────────────────────────────────────────────────────

/// Entry lifecycle: `pending → processing → {completed | failed}`.
/// No transition skips `processing`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Failed)
    }
}

// ─── SessionClaim ─────────────────────────────────────────────────────────────

/// Optional proof that an entry originates from an authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaim {
    pub session_id: String,
    pub token: String,
}

// ─── ActionEntry ──────────────────────────────────────────────────────────────

/// One unit of requested work and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    /// Free-form producer identifier, for diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Session claim verified by the consumer before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionClaim>,
    #[serde(default)]
    pub status: ActionStatus,
    #[serde(default = "now_rfc3339")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl ActionEntry {
    /// Producer-side constructor: a fresh pending entry with a new id.
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action: action.into(),
            params,
            source: None,
            session: None,
            status: ActionStatus::Pending,
            created_at: now_rfc3339(),
            result: None,
            error: None,
            completed_at: None,
        }
    }

    /// Transition to `completed` with a result payload.
    pub fn complete(&mut self, result: Value) {
        self.status = ActionStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now_rfc3339());
    }

    /// Transition to `failed` with a descriptive error.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = ActionStatus::Failed;
        self.error = Some(error.into());
        self.result = None;
        self.completed_at = Some(now_rfc3339());
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_entry_is_pending_with_unique_id() {
        let a = ActionEntry::new("echo", json!({"msg": "x"}));
        let b = ActionEntry::new("echo", json!({"msg": "x"}));
        assert_eq!(a.status, ActionStatus::Pending);
        assert_ne!(a.id, b.id);
        assert!(!a.created_at.is_empty());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ActionStatus::Processing).unwrap(),
            "\"processing\""
        );
        let back: ActionStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, ActionStatus::Failed);
    }

    #[test]
    fn minimal_producer_payload_parses() {
        // A producer only has to supply id and action; everything else
        // defaults (status → pending).
        let entry: ActionEntry =
            serde_json::from_str(r#"{"id": "abc", "action": "echo"}"#).unwrap();
        assert_eq!(entry.status, ActionStatus::Pending);
        assert_eq!(entry.params, Value::Null);
        assert!(entry.session.is_none());
    }

    #[test]
    fn missing_action_is_rejected() {
        let err = serde_json::from_str::<ActionEntry>(r#"{"id": "abc"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn complete_and_fail_are_terminal() {
        let mut entry = ActionEntry::new("echo", json!({}));
        entry.complete(json!({"ok": true}));
        assert!(entry.status.is_terminal());
        assert!(entry.completed_at.is_some());

        let mut entry = ActionEntry::new("echo", json!({}));
        entry.fail("boom");
        assert_eq!(entry.status, ActionStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("boom"));
        assert!(entry.result.is_none());
    }

    #[test]
    fn wire_format_is_camel_case() {
        let mut entry = ActionEntry::new("echo", json!({}));
        entry.complete(json!(1));
        let raw = serde_json::to_string(&entry).unwrap();
        assert!(raw.contains("\"createdAt\""));
        assert!(raw.contains("\"completedAt\""));
        assert!(!raw.contains("\"created_at\""));
    }
}
