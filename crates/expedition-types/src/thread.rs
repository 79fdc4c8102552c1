use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wall-clock milliseconds since the epoch, used for deadlines and event stamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// A single immutable, append-only entry in a thread's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "toolCallId")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// One of the three decisions `allowed_decisions` can name (§3 Decision).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedDecision {
    Approve,
    Edit,
    Reject,
}

/// A gated tool call the agent is proposing, surfaced to the human for a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub name: String,
    pub arguments: Value,
    pub description: String,
}

/// A persisted pause in a turn, awaiting exactly one human decision (I1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interrupt {
    #[serde(rename = "threadId")]
    pub thread_id: String,
    pub action_requests: Vec<ActionRequest>,
    pub allowed_decisions: Vec<AllowedDecision>,
    /// Absolute deadline in epoch milliseconds, after which C1 synthesizes a reject.
    pub deadline_ms: u64,
}

/// The replacement tool call a client sends back with an `edit` decision (§6): the same
/// tool `name` the agent proposed, with `args` the human wants it re-run with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditedAction {
    pub name: String,
    pub args: Value,
}

/// The human's answer to a live `Interrupt`, tagged the way the wire protocol encodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Edit { edited_action: EditedAction },
    Reject { message: String },
}

impl Decision {
    /// The `AllowedDecision` member this decision corresponds to, for membership checks.
    pub fn kind(&self) -> AllowedDecision {
        match self {
            Decision::Approve => AllowedDecision::Approve,
            Decision::Edit { .. } => AllowedDecision::Edit,
            Decision::Reject { .. } => AllowedDecision::Reject,
        }
    }

    /// The synthetic reject C1 manufactures when a deadline elapses with no reply (§4.1).
    pub fn timeout() -> Self {
        Decision::Reject {
            message: "timeout - no decision received".to_string(),
        }
    }

    /// The synthetic reject C2 manufactures when a socket disconnects mid-interrupt (§4.2).
    pub fn cancelled() -> Self {
        Decision::Reject {
            message: "cancelled - conversation disconnected".to_string(),
        }
    }
}

/// A conversation thread: an append-only message log plus opaque agent checkpoint state.
/// Owned entirely in-memory by `ThreadStore`; persistence encoding is a collaborator's
/// concern (§1 non-goals).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Thread {
    pub thread_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Opaque to the core — the agent runtime's resumable state.
    #[serde(default)]
    pub checkpoint: Value,
    #[serde(default)]
    pub pending_interrupt: Option<Interrupt>,
}

impl Thread {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            checkpoint: Value::Null,
            pending_interrupt: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_kind_matches_allowed_decision_variant() {
        assert_eq!(Decision::Approve.kind(), AllowedDecision::Approve);
        assert_eq!(
            Decision::Edit {
                edited_action: EditedAction {
                    name: "create_research_plan".to_string(),
                    args: Value::Null
                }
            }
            .kind(),
            AllowedDecision::Edit
        );
        assert_eq!(
            Decision::Reject {
                message: "no".into()
            }
            .kind(),
            AllowedDecision::Reject
        );
    }

    #[test]
    fn timeout_decision_is_a_reject_with_reason() {
        match Decision::timeout() {
            Decision::Reject { message } => assert!(message.contains("timeout")),
            _ => panic!("expected reject"),
        }
    }

    #[test]
    fn new_thread_has_no_pending_interrupt() {
        let thread = Thread::new("t-1");
        assert!(thread.pending_interrupt.is_none());
        assert!(thread.messages.is_empty());
    }
}
