use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAggregation {
    MergeAll,
    BestOf,
    Consensus,
}

/// `agent_instances[i]` of an approved mission plan (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstanceSpec {
    pub instance_id: String,
    pub agent_type: String,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub seed_context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starter_sources: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub requires_outputs_from: Vec<String>,
    pub max_steps: u32,
    pub timeout_seconds: u64,
    /// Retry budget for this instance task (§4.5); reduce tasks are never retried.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    1
}

/// `sub_stages[s]` of an approved mission plan (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubStageSpec {
    pub sub_stage_id: String,
    pub agent_instances: Vec<String>,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub depends_on_sub_stages: Vec<String>,
    pub output_aggregation: OutputAggregation,
}

/// `stages[g]` of an approved mission plan (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage_id: String,
    pub sub_stages: Vec<String>,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub depends_on_stages: Vec<String>,
}

/// The DAG literal an agent proposes and a human approves through an interrupt decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionPlan {
    pub mission_id: String,
    pub agent_instances: Vec<AgentInstanceSpec>,
    pub sub_stages: Vec<SubStageSpec>,
    pub stages: Vec<StageSpec>,
    /// Plan-level opt-out of the default fail-fast policy (§4.5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_fast: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Runs one agent instance with one set of objectives.
    Instance { instance_id: String },
    /// Aggregates the outputs of one sub-stage's instance tasks.
    Reduce { sub_stage_id: String },
}

/// A node in the compiled task graph. Deterministic id per §4.4; state is owned
/// exclusively by the scheduler (C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub payload: TaskPayload,
    pub depends_on: Vec<String>,
    pub state: TaskState,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OutputRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn instance_task_id(mission_id: &str, instance_id: &str) -> String {
        format!("instance::{mission_id}::{instance_id}")
    }

    pub fn reduce_task_id(mission_id: &str, sub_stage_id: &str) -> String {
        format!("substage_reduce::{mission_id}::{sub_stage_id}")
    }
}

/// The immutable, single-writer-per-key output of a completed task (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputRecord {
    #[serde(default)]
    pub objectives_completed: Vec<String>,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub entities_discovered: Vec<String>,
    #[serde(default)]
    pub file_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// The compiled, immutable output of the Plan Compiler (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraph {
    pub mission_id: String,
    pub tasks: HashMap<String, Task>,
    pub roots: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Structured progress events emitted by C5 (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MissionEvent {
    MissionStarted {
        mission_id: String,
    },
    TaskStarted {
        mission_id: String,
        task_id: String,
    },
    TaskSucceeded {
        mission_id: String,
        task_id: String,
    },
    TaskFailed {
        mission_id: String,
        task_id: String,
        reason: String,
    },
    TaskCancelled {
        mission_id: String,
        task_id: String,
    },
    MissionSucceeded {
        mission_id: String,
    },
    MissionFailed {
        mission_id: String,
        reason: String,
    },
}

impl MissionEvent {
    pub fn mission_id(&self) -> &str {
        match self {
            MissionEvent::MissionStarted { mission_id }
            | MissionEvent::TaskStarted { mission_id, .. }
            | MissionEvent::TaskSucceeded { mission_id, .. }
            | MissionEvent::TaskFailed { mission_id, .. }
            | MissionEvent::TaskCancelled { mission_id, .. }
            | MissionEvent::MissionSucceeded { mission_id }
            | MissionEvent::MissionFailed { mission_id, .. } => mission_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_deterministic_and_distinct_by_kind() {
        let instance = Task::instance_task_id("m1", "a1");
        let reduce = Task::reduce_task_id("m1", "a1");
        assert_eq!(instance, "instance::m1::a1");
        assert_eq!(reduce, "substage_reduce::m1::a1");
        assert_ne!(instance, reduce);
    }

    #[test]
    fn mission_event_exposes_mission_id_for_every_variant() {
        let event = MissionEvent::TaskFailed {
            mission_id: "m1".to_string(),
            task_id: "t1".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(event.mission_id(), "m1");
    }
}
