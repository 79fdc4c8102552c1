use serde::{Deserialize, Serialize};

use crate::thread::{ActionRequest, AllowedDecision, Decision};

/// Frames accepted from the client on `/threads/{thread_id}/hitl` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SendMessage { content: String },
    Decision { decisions: Vec<Decision> },
}

/// The normalized interrupt payload a client sees inside an `interrupt` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptData {
    pub action_requests: Vec<ActionRequest>,
    pub allowed_decisions: Vec<AllowedDecision>,
}

/// Frames emitted on the socket (§4.2, §6). Names and payload shapes are normative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Thinking,
    Content { content: String },
    Interrupt { interrupt_data: InterruptData },
    WaitingForDecision { message: String },
    Resuming { message: String },
    Done,
    Error { error: String },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_round_trips_through_json() {
        let frame = ClientFrame::SendMessage {
            content: "hello".to_string(),
        };
        let raw = serde_json::to_string(&frame).unwrap();
        assert_eq!(raw, r#"{"type":"send_message","content":"hello"}"#);
        let back: ClientFrame = serde_json::from_str(&raw).unwrap();
        match back {
            ClientFrame::SendMessage { content } => assert_eq!(content, "hello"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decision_frame_parses_nested_decision_variants() {
        let raw = r#"{"type":"decision","decisions":[{"type":"approve"}]}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Decision { decisions } => {
                assert_eq!(decisions.len(), 1);
                assert!(matches!(decisions[0], Decision::Approve));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decision_frame_parses_the_documented_edit_shape() {
        let raw = r#"{"type":"decision","decisions":[{"type":"edit","edited_action":{"name":"create_research_plan","args":{"budget":30}}}]}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Decision { decisions } => match &decisions[0] {
                Decision::Edit { edited_action } => {
                    assert_eq!(edited_action.name, "create_research_plan");
                    assert_eq!(edited_action.args["budget"], 30);
                }
                other => panic!("wrong decision variant: {other:?}"),
            },
            _ => panic!("wrong frame variant"),
        }
    }

    #[test]
    fn server_error_frame_serializes_with_error_field() {
        let frame = ServerFrame::error("bad frame");
        let raw = serde_json::to_value(&frame).unwrap();
        assert_eq!(raw["type"], "error");
        assert_eq!(raw["error"], "bad frame");
    }
}
