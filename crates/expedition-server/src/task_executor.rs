use std::collections::HashMap;

use async_trait::async_trait;

use expedition_orchestrator::scheduler::{TaskError, TaskExecutor};
use expedition_types::{AgentInstanceSpec, OutputRecord};

/// A deterministic, non-LLM-backed instance executor for the `serve`/`run` CLI demo and
/// integration tests — the orchestrator's analogue of `expedition_core::ScriptedAgentBackend`.
/// Produces one finding per objective; any tool in `allowed_tools` is treated as
/// auto-approved, since instance tasks run the non-interactive variant of the agent
/// runtime (§4.5).
pub struct ScriptedTaskExecutor;

#[async_trait]
impl TaskExecutor for ScriptedTaskExecutor {
    async fn execute_instance(
        &self,
        _mission_id: &str,
        instance: &AgentInstanceSpec,
        previous_outputs: HashMap<String, OutputRecord>,
    ) -> Result<OutputRecord, TaskError> {
        let mut findings: Vec<String> = instance
            .objectives
            .iter()
            .map(|objective| format!("{}: {objective}", instance.instance_id))
            .collect();
        for (source, record) in &previous_outputs {
            findings.extend(
                record
                    .findings
                    .iter()
                    .map(|f| format!("(via {source}) {f}")),
            );
        }
        Ok(OutputRecord {
            objectives_completed: instance.objectives.clone(),
            findings,
            entities_discovered: Vec::new(),
            file_refs: instance.starter_sources.clone().unwrap_or_default(),
            metadata: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produces_one_finding_per_objective() {
        let instance = AgentInstanceSpec {
            instance_id: "a1".to_string(),
            agent_type: "researcher".to_string(),
            objectives: vec!["find x".to_string(), "find y".to_string()],
            seed_context: String::new(),
            starter_sources: None,
            allowed_tools: vec![],
            requires_outputs_from: vec![],
            max_steps: 10,
            timeout_seconds: 30,
            max_attempts: 1,
        };
        let record = ScriptedTaskExecutor
            .execute_instance("m1", &instance, HashMap::new())
            .await
            .unwrap();
        assert_eq!(record.findings.len(), 2);
    }
}
