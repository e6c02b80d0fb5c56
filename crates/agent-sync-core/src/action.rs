//! Pending action model.

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action identifier, unique within the backend ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Wrap a raw identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ActionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for ActionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle status of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Awaiting a human decision.
    Pending,
    /// Approved and handed back to the agent.
    Approved,
    /// Rejected by a human.
    #[serde(alias = "denied")]
    Rejected,
    /// The backend could not carry the decision out.
    Failed,
}

impl ActionStatus {
    /// Whether the status ends the action's lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A tool invocation awaiting human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    /// Unique identity of the action.
    pub id: ActionId,
    /// Name of the tool being invoked.
    #[serde(alias = "tool")]
    pub tool_name: String,
    /// Structured tool arguments.
    #[serde(default, alias = "args")]
    pub tool_args: Value,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Optional rendered preview (diff, command line, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    /// Session the action belongs to, if scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl PendingAction {
    /// Create an action with empty arguments and no preview.
    #[must_use]
    pub fn new(
        id: impl Into<ActionId>,
        tool_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            tool_args: Value::Null,
            description: description.into(),
            preview: None,
            session_id: None,
        }
    }

    /// Attach tool arguments.
    #[must_use]
    pub fn with_args(mut self, args: Value) -> Self {
        self.tool_args = args;
        self
    }

    /// Attach a preview.
    #[must_use]
    pub fn with_preview(mut self, preview: impl Into<String>) -> Self {
        self.preview = Some(preview.into());
        self
    }

    /// Scope the action to a session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// An action together with its current status, as held in the view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedAction {
    /// The action as first sighted.
    pub action: PendingAction,
    /// Current status.
    pub status: ActionStatus,
}

/// Result for one id of a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// The action this result is for.
    pub id: ActionId,
    /// Whether the item completed.
    pub ok: bool,
    /// Failure reason when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItemResult {
    /// A completed item.
    #[must_use]
    pub const fn succeeded(id: ActionId) -> Self {
        Self {
            id,
            ok: true,
            error: None,
        }
    }

    /// A failed item.
    #[must_use]
    pub fn failed(id: ActionId, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Per-item outcome of a batch approve/reject.
///
/// A partial failure is reported here item by item and is never turned into
/// a whole-batch error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// One entry per requested id, in request order.
    pub items: Vec<BatchItemResult>,
}

impl BatchOutcome {
    /// Items that completed.
    pub fn succeeded(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.items.iter().filter(|item| item.ok)
    }

    /// Items that failed.
    pub fn failed(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.items.iter().filter(|item| !item.ok)
    }

    /// True when some, but not all, items failed.
    #[must_use]
    pub fn is_partial_failure(&self) -> bool {
        let failed = self.failed().count();
        failed > 0 && failed < self.items.len()
    }

    /// True when every item completed.
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        self.items.iter().all(|item| item.ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_accepts_short_field_names() {
        let json = r#"{"id":"a1","tool":"bash","args":{"cmd":"ls"},"description":"list"}"#;
        let action: PendingAction = serde_json::from_str(json).unwrap();
        assert_eq!(action.id.as_str(), "a1");
        assert_eq!(action.tool_name, "bash");
        assert_eq!(action.tool_args["cmd"], "ls");
        assert!(action.preview.is_none());
    }

    #[test]
    fn test_status_terminality() {
        assert!(!ActionStatus::Pending.is_terminal());
        assert!(ActionStatus::Approved.is_terminal());
        assert!(ActionStatus::Rejected.is_terminal());
        assert!(ActionStatus::Failed.is_terminal());

        let denied: ActionStatus = serde_json::from_str("\"denied\"").unwrap();
        assert_eq!(denied, ActionStatus::Rejected);
    }

    #[test]
    fn test_batch_outcome_breakdown() {
        let outcome = BatchOutcome {
            items: vec![
                BatchItemResult::succeeded("a1".into()),
                BatchItemResult::failed("a2".into(), "boom"),
                BatchItemResult::succeeded("a3".into()),
            ],
        };
        assert!(outcome.is_partial_failure());
        assert!(!outcome.is_complete_success());
        assert_eq!(outcome.succeeded().count(), 2);
        let failed: Vec<_> = outcome.failed().map(|i| i.id.as_str()).collect();
        assert_eq!(failed, ["a2"]);
    }
}
