use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use expedition_types::{ActionRequest, AllowedDecision, Decision, EditedAction, Interrupt, Message};

/// One increment of a streamed turn (C3, §4.3). `Interrupt` always ends the stream — the
/// caller resumes with a fresh stream via `resume_turn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Thinking,
    ContentDelta { text: String },
    Interrupt { interrupt: Interrupt },
    Done,
    Error { reason: String },
}

pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// The collaborator this adapter wraps (§1 non-goals: "the real LLM-driven agent
/// loop... is a collaborator"). It speaks in an opaque checkpoint and may describe a
/// pending interrupt in any of the nested shapes `normalize_raw_interrupt` tolerates.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn step(
        &self,
        thread_id: &str,
        messages: &[Message],
        checkpoint: Value,
    ) -> anyhow::Result<BackendStep>;

    async fn resume(
        &self,
        thread_id: &str,
        checkpoint: Value,
        decision: Decision,
    ) -> anyhow::Result<BackendStep>;
}

/// What a backend produces for one step: text to surface and the new checkpoint. Whether
/// the turn is finished or paused on a gated tool call is read off the checkpoint's shape
/// by `events_for_step`, not tracked separately here (§4.3 inspects the checkpoint, full
/// stop — a backend that forgot to clear a stale interrupt record would otherwise disagree
/// with itself about whether it's done).
#[derive(Debug, Clone)]
pub struct BackendStep {
    pub content: String,
    pub checkpoint: Value,
}

/// Raw shape the interrupt record in a checkpoint may take (§4.3, §9): a single-element
/// list, an object wrapping the payload in `.value`, or the bare payload. `serde`'s
/// untagged matching tries each variant in order, which gives us the fold for free.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawInterruptShape {
    List(Vec<RawInterruptPayload>),
    Wrapped { value: RawInterruptPayload },
    Bare(RawInterruptPayload),
}

#[derive(Debug, Clone, Deserialize)]
struct RawInterruptPayload {
    action_requests: Vec<ActionRequest>,
    allowed_decisions: Vec<AllowedDecision>,
}

/// Normalizes whatever shape a backend's checkpoint used for its pending interrupt into
/// the flat `Interrupt` the rest of the system deals in. Returns `None` if `raw` is
/// `Value::Null` (no interrupt pending) or doesn't parse as any tolerated shape.
fn normalize_raw_interrupt(
    thread_id: &str,
    raw: &Value,
    deadline_ms: u64,
) -> Option<Interrupt> {
    if raw.is_null() {
        return None;
    }
    let shape: RawInterruptShape = serde_json::from_value(raw.clone()).ok()?;
    let payload = match shape {
        RawInterruptShape::List(mut items) if !items.is_empty() => items.remove(0),
        RawInterruptShape::List(_) => return None,
        RawInterruptShape::Wrapped { value } => value,
        RawInterruptShape::Bare(payload) => payload,
    };
    Some(Interrupt {
        thread_id: thread_id.to_string(),
        action_requests: payload.action_requests,
        allowed_decisions: payload.allowed_decisions,
        deadline_ms,
    })
}

/// Declarative description of one tool a backend may call (§4.3/§6 tool gating policy):
/// whether it requires human approval, which decisions it'll accept, and how to render
/// its arguments into the human-readable text an `ActionRequest` carries.
pub struct ToolSpec {
    pub name: String,
    pub requires_approval: bool,
    pub allowed_decisions: Vec<AllowedDecision>,
    describe: Arc<dyn Fn(&Value) -> String + Send + Sync>,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        requires_approval: bool,
        allowed_decisions: Vec<AllowedDecision>,
        describe: impl Fn(&Value) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            requires_approval,
            allowed_decisions,
            describe: Arc::new(describe),
        }
    }

    pub fn describe(&self, arguments: &Value) -> String {
        (self.describe)(arguments)
    }
}

/// The set of tools a deployment recognizes, consulted by backends when deciding whether
/// a proposed call needs to pause for a decision rather than run straight through.
#[derive(Default)]
pub struct ToolRegistry {
    tools: std::collections::HashMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn requires_approval(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.requires_approval).unwrap_or(false)
    }
}

/// C3: drives a `AgentBackend` and normalizes its raw interrupt shapes into the flat
/// wire-facing `Interrupt`, so C2 never has to know what the underlying agent framework
/// looks like. Also tracks each thread's last checkpoint, since the agent runtime
/// interface (§6) exposes `get_state` as its own method rather than threading the
/// checkpoint through every call.
pub struct AgentRuntimeAdapter<B: AgentBackend> {
    backend: Arc<B>,
    interrupt_deadline_seconds: u64,
    checkpoints: Arc<tokio::sync::Mutex<std::collections::HashMap<String, Value>>>,
}

impl<B: AgentBackend + 'static> AgentRuntimeAdapter<B> {
    pub fn new(backend: B, interrupt_deadline_seconds: u64) -> Self {
        Self {
            backend: Arc::new(backend),
            interrupt_deadline_seconds,
            checkpoints: Arc::new(tokio::sync::Mutex::new(std::collections::HashMap::new())),
        }
    }

    fn deadline_ms(&self) -> u64 {
        expedition_types::now_ms() + self.interrupt_deadline_seconds * 1_000
    }

    /// The thread's last-known checkpoint, for a caller to persist via `ThreadStore`.
    pub async fn get_state(&self, thread_id: &str) -> Value {
        self.checkpoints
            .lock()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Starts a fresh turn from the thread's full message history plus its last saved
    /// checkpoint, yielding events until the backend either finishes or pauses.
    pub fn stream_turn(&self, thread_id: String, messages: Vec<Message>, checkpoint: Value) -> EventStream {
        let deadline_ms = self.deadline_ms();
        let backend = self.backend.clone();
        let checkpoints = self.checkpoints.clone();
        Box::pin(async_stream::stream! {
            yield AgentEvent::Thinking;
            match backend.step(&thread_id, &messages, checkpoint).await {
                Ok(step) => {
                    checkpoints.lock().await.insert(thread_id.clone(), step.checkpoint.clone());
                    for event in events_for_step(&thread_id, step, deadline_ms) {
                        yield event;
                    }
                }
                Err(err) => yield AgentEvent::Error { reason: err.to_string() },
            }
        })
    }

    /// Applies a human decision to a backend paused mid-turn and resumes it (§4.3
    /// resumption semantics: approve re-runs as proposed, edit re-runs with replacement
    /// arguments, reject injects the rejection and lets planning continue). Reads the
    /// checkpoint the preceding `Interrupt` was raised against from the internal cache.
    pub fn resume_turn(&self, thread_id: String, decision: Decision) -> EventStream {
        let deadline_ms = self.deadline_ms();
        let backend = self.backend.clone();
        let checkpoints = self.checkpoints.clone();
        Box::pin(async_stream::stream! {
            let checkpoint = checkpoints
                .lock()
                .await
                .get(&thread_id)
                .cloned()
                .unwrap_or(Value::Null);
            match backend.resume(&thread_id, checkpoint, decision).await {
                Ok(step) => {
                    checkpoints.lock().await.insert(thread_id.clone(), step.checkpoint.clone());
                    for event in events_for_step(&thread_id, step, deadline_ms) {
                        yield event;
                    }
                }
                Err(err) => yield AgentEvent::Error { reason: err.to_string() },
            }
        })
    }
}

fn events_for_step(thread_id: &str, step: BackendStep, deadline_ms: u64) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    if !step.content.is_empty() {
        events.push(AgentEvent::ContentDelta { text: step.content });
    }
    match normalize_raw_interrupt(thread_id, &step.checkpoint, deadline_ms) {
        Some(interrupt) => events.push(AgentEvent::Interrupt { interrupt }),
        None => events.push(AgentEvent::Done),
    }
    events
}

/// A deterministic, non-LLM-backed collaborator for tests and the `run` CLI demo (§13).
/// Any user message containing "plan" (case-insensitive) proposes the gated
/// `create_research_plan` tool call; anything else finishes the turn directly.
pub struct ScriptedAgentBackend;

impl ScriptedAgentBackend {
    const TOOL_NAME: &'static str = "create_research_plan";

    fn propose_plan(&self, budget: u64) -> Value {
        serde_json::json!({
            "action_requests": [{
                "name": Self::TOOL_NAME,
                "arguments": { "budget": budget },
                "description": format!("Create a research plan with budget={budget}"),
            }],
            "allowed_decisions": ["approve", "edit", "reject"],
        })
    }
}

#[async_trait]
impl AgentBackend for ScriptedAgentBackend {
    async fn step(
        &self,
        _thread_id: &str,
        messages: &[Message],
        _checkpoint: Value,
    ) -> anyhow::Result<BackendStep> {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        if last.to_lowercase().contains("plan") {
            Ok(BackendStep {
                content: "Drafting a research plan before proceeding.".to_string(),
                checkpoint: self.propose_plan(10),
            })
        } else {
            Ok(BackendStep {
                content: format!("Acknowledged: {last}"),
                checkpoint: Value::Null,
            })
        }
    }

    async fn resume(
        &self,
        _thread_id: &str,
        _checkpoint: Value,
        decision: Decision,
    ) -> anyhow::Result<BackendStep> {
        let content = match decision {
            Decision::Approve => "Plan approved with budget=10. Proceeding.".to_string(),
            Decision::Edit { edited_action } => {
                let budget = edited_action
                    .args
                    .get("budget")
                    .and_then(Value::as_u64)
                    .unwrap_or(10);
                format!("Plan approved with budget={budget}. Proceeding.")
            }
            Decision::Reject { message } => format!("Plan rejected: {message}. Standing by."),
        };
        Ok(BackendStep {
            content,
            checkpoint: Value::Null,
        })
    }
}
