use std::collections::{HashMap, HashSet};

use thiserror::Error;

use expedition_types::{
    MissionPlan, OutputAggregation, Task, TaskGraph, TaskPayload, TaskState,
};

/// A validation failure against one of I2-I6 (§4.4). Compilation is all-or-nothing: any
/// one of these aborts the whole attempt, so callers get the full list rather than the
/// first failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("sub-stage `{sub_stage_id}` references unknown instance `{instance_id}`")]
    UnknownInstance {
        sub_stage_id: String,
        instance_id: String,
    },
    #[error("stage `{stage_id}` references unknown sub-stage `{sub_stage_id}`")]
    UnknownSubStage { stage_id: String, sub_stage_id: String },
    #[error("sub-stage `{sub_stage_id}` has no agent instances")]
    EmptySubStage { sub_stage_id: String },
    #[error("instance `{instance_id}` allows unknown tool `{tool_name}`")]
    UnknownTool { instance_id: String, tool_name: String },
    #[error("dependency graph contains a cycle through `{node}`")]
    Cycle { node: String },
    #[error(
        "instance `{instance_id}` requires output of `{referenced}`, which is not in a \
         dependency sub-stage or an earlier sequential sibling"
    )]
    ForwardReference {
        instance_id: String,
        referenced: String,
    },
    #[error("sub-stage `{sub_stage_id}` is not owned by exactly one stage")]
    UnownedSubStage { sub_stage_id: String },
}

/// Translates an approved mission plan into its task graph (§4.4). `known_tools` is the
/// tool registry's name set, consulted for I5.
pub fn compile_plan(
    plan: &MissionPlan,
    known_tools: &HashSet<String>,
) -> Result<TaskGraph, Vec<CompileError>> {
    let mut errors = Vec::new();

    let instances_by_id: HashMap<&str, _> = plan
        .agent_instances
        .iter()
        .map(|i| (i.instance_id.as_str(), i))
        .collect();
    let sub_stages_by_id: HashMap<&str, _> = plan
        .sub_stages
        .iter()
        .map(|s| (s.sub_stage_id.as_str(), s))
        .collect();

    // I2, B3: every referenced id exists; every sub-stage has at least one instance.
    for sub_stage in &plan.sub_stages {
        if sub_stage.agent_instances.is_empty() {
            errors.push(CompileError::EmptySubStage {
                sub_stage_id: sub_stage.sub_stage_id.clone(),
            });
        }
        for instance_id in &sub_stage.agent_instances {
            if !instances_by_id.contains_key(instance_id.as_str()) {
                errors.push(CompileError::UnknownInstance {
                    sub_stage_id: sub_stage.sub_stage_id.clone(),
                    instance_id: instance_id.clone(),
                });
            }
        }
    }
    for stage in &plan.stages {
        for sub_stage_id in &stage.sub_stages {
            if !sub_stages_by_id.contains_key(sub_stage_id.as_str()) {
                errors.push(CompileError::UnknownSubStage {
                    stage_id: stage.stage_id.clone(),
                    sub_stage_id: sub_stage_id.clone(),
                });
            }
        }
    }

    // Owning maps: every sub-stage must belong to exactly one stage; every instance to
    // exactly one sub-stage (guaranteed by the loop above once ids resolve).
    let mut owning_stage: HashMap<&str, &str> = HashMap::new();
    for stage in &plan.stages {
        for sub_stage_id in &stage.sub_stages {
            owning_stage.insert(sub_stage_id.as_str(), stage.stage_id.as_str());
        }
    }
    for sub_stage in &plan.sub_stages {
        if !owning_stage.contains_key(sub_stage.sub_stage_id.as_str()) {
            errors.push(CompileError::UnownedSubStage {
                sub_stage_id: sub_stage.sub_stage_id.clone(),
            });
        }
    }
    let mut owning_sub_stage: HashMap<&str, &str> = HashMap::new();
    for sub_stage in &plan.sub_stages {
        for instance_id in &sub_stage.agent_instances {
            owning_sub_stage.insert(instance_id.as_str(), sub_stage.sub_stage_id.as_str());
        }
    }

    // I5: every allowed tool is known.
    for instance in &plan.agent_instances {
        for tool_name in &instance.allowed_tools {
            if !known_tools.contains(tool_name) {
                errors.push(CompileError::UnknownTool {
                    instance_id: instance.instance_id.clone(),
                    tool_name: tool_name.clone(),
                });
            }
        }
    }

    // I4: requires_outputs_from must resolve to an instance in a dependency sub-stage of
    // the citer's owning sub-stage, a dependency stage's sub-stage, or (same sub-stage,
    // sequential mode only) an earlier sibling in agent_instances order.
    for sub_stage in &plan.sub_stages {
        let dep_sub_stages: HashSet<&str> = sub_stage
            .depends_on_sub_stages
            .iter()
            .map(String::as_str)
            .collect();
        let dep_stage_sub_stages: HashSet<&str> = owning_stage
            .get(sub_stage.sub_stage_id.as_str())
            .and_then(|stage_id| plan.stages.iter().find(|s| &s.stage_id == stage_id))
            .map(|stage| {
                stage
                    .depends_on_stages
                    .iter()
                    .flat_map(|dep_stage_id| {
                        plan.stages
                            .iter()
                            .find(|s| &s.stage_id == dep_stage_id)
                            .map(|s| s.sub_stages.iter().map(String::as_str).collect::<Vec<_>>())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();

        for (position, instance_id) in sub_stage.agent_instances.iter().enumerate() {
            let Some(instance) = instances_by_id.get(instance_id.as_str()) else {
                continue;
            };
            for referenced in &instance.requires_outputs_from {
                let referenced_sub_stage = owning_sub_stage.get(referenced.as_str()).copied();
                let in_dependency = referenced_sub_stage
                    .map(|s| dep_sub_stages.contains(s) || dep_stage_sub_stages.contains(s))
                    .unwrap_or(false);
                let is_earlier_sibling = referenced_sub_stage == Some(sub_stage.sub_stage_id.as_str())
                    && sub_stage.execution_mode == expedition_types::ExecutionMode::Sequential
                    && sub_stage
                        .agent_instances
                        .iter()
                        .position(|id| id == referenced)
                        .map(|earlier_position| earlier_position < position)
                        .unwrap_or(false);
                if !in_dependency && !is_earlier_sibling {
                    errors.push(CompileError::ForwardReference {
                        instance_id: instance_id.clone(),
                        referenced: referenced.clone(),
                    });
                }
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    // Rules 1-3: build tasks now that every reference is known to resolve.
    let mut tasks: HashMap<String, Task> = HashMap::new();

    for sub_stage in &plan.sub_stages {
        let reduce_id = Task::reduce_task_id(&plan.mission_id, &sub_stage.sub_stage_id);
        let depends_on: Vec<String> = sub_stage
            .agent_instances
            .iter()
            .map(|instance_id| Task::instance_task_id(&plan.mission_id, instance_id))
            .collect();
        tasks.insert(
            reduce_id.clone(),
            Task {
                task_id: reduce_id,
                payload: TaskPayload::Reduce {
                    sub_stage_id: sub_stage.sub_stage_id.clone(),
                },
                depends_on,
                state: TaskState::Pending,
                attempts: 0,
                max_attempts: 1,
                result: None,
                error: None,
            },
        );
    }

    for instance in &plan.agent_instances {
        let task_id = Task::instance_task_id(&plan.mission_id, &instance.instance_id);
        let mut depends_on: HashSet<String> = HashSet::new();

        if let Some(owning) = owning_sub_stage.get(instance.instance_id.as_str()) {
            let sub_stage = sub_stages_by_id[owning];
            for dep_sub_stage in &sub_stage.depends_on_sub_stages {
                depends_on.insert(Task::reduce_task_id(&plan.mission_id, dep_sub_stage));
            }
            if let Some(stage_id) = owning_stage.get(*owning) {
                if let Some(stage) = plan.stages.iter().find(|s| &s.stage_id == stage_id) {
                    for dep_stage_id in &stage.depends_on_stages {
                        if let Some(dep_stage) =
                            plan.stages.iter().find(|s| &s.stage_id == dep_stage_id)
                        {
                            for dep_sub_stage in &dep_stage.sub_stages {
                                depends_on
                                    .insert(Task::reduce_task_id(&plan.mission_id, dep_sub_stage));
                            }
                        }
                    }
                }
            }
        }
        for referenced in &instance.requires_outputs_from {
            depends_on.insert(Task::instance_task_id(&plan.mission_id, referenced));
        }

        tasks.insert(
            task_id.clone(),
            Task {
                task_id,
                payload: TaskPayload::Instance {
                    instance_id: instance.instance_id.clone(),
                },
                depends_on: depends_on.into_iter().collect(),
                state: TaskState::Pending,
                attempts: 0,
                max_attempts: instance.max_attempts.max(1),
                result: None,
                error: None,
            },
        );
    }

    // I3: the combined task graph must be acyclic.
    if let Some(node) = find_cycle(&tasks) {
        return Err(vec![CompileError::Cycle { node }]);
    }

    let mut roots: Vec<String> = tasks
        .values()
        .filter(|t| t.depends_on.is_empty())
        .map(|t| t.task_id.clone())
        .collect();
    roots.sort();

    Ok(TaskGraph {
        mission_id: plan.mission_id.clone(),
        tasks,
        roots,
    })
}

/// DFS cycle detection over the compiled `depends_on` edges. Returns one offending node
/// id if a cycle exists — enough for a structured error; `spec.md` doesn't ask for the
/// full cycle path.
fn find_cycle(tasks: &HashMap<String, Task>) -> Option<String> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(
        node: &'a str,
        tasks: &'a HashMap<String, Task>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<String> {
        match marks.get(node) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(node.to_string()),
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(task) = tasks.get(node) {
            for dep in &task.depends_on {
                if let Some(cycle_node) = visit(dep, tasks, marks) {
                    return Some(cycle_node);
                }
            }
        }
        marks.insert(node, Mark::Done);
        None
    }

    for id in tasks.keys() {
        if let Some(node) = visit(id, tasks, &mut marks) {
            return Some(node);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use expedition_types::{AgentInstanceSpec, ExecutionMode, StageSpec, SubStageSpec};

    fn instance(id: &str, requires: Vec<&str>) -> AgentInstanceSpec {
        AgentInstanceSpec {
            instance_id: id.to_string(),
            agent_type: "researcher".to_string(),
            objectives: vec!["find things".to_string()],
            seed_context: String::new(),
            starter_sources: None,
            allowed_tools: vec![],
            requires_outputs_from: requires.into_iter().map(String::from).collect(),
            max_steps: 10,
            timeout_seconds: 60,
            max_attempts: 1,
        }
    }

    fn fan_out_plan() -> MissionPlan {
        MissionPlan {
            mission_id: "m1".to_string(),
            agent_instances: vec![instance("a1", vec![]), instance("a2", vec![]), instance("b1", vec![])],
            sub_stages: vec![
                SubStageSpec {
                    sub_stage_id: "sA".to_string(),
                    agent_instances: vec!["a1".to_string(), "a2".to_string()],
                    execution_mode: ExecutionMode::Parallel,
                    depends_on_sub_stages: vec![],
                    output_aggregation: OutputAggregation::MergeAll,
                },
                SubStageSpec {
                    sub_stage_id: "sB".to_string(),
                    agent_instances: vec!["b1".to_string()],
                    execution_mode: ExecutionMode::Parallel,
                    depends_on_sub_stages: vec!["sA".to_string()],
                    output_aggregation: OutputAggregation::MergeAll,
                },
            ],
            stages: vec![
                StageSpec {
                    stage_id: "g1".to_string(),
                    sub_stages: vec!["sA".to_string()],
                    execution_mode: ExecutionMode::Parallel,
                    depends_on_stages: vec![],
                },
                StageSpec {
                    stage_id: "g2".to_string(),
                    sub_stages: vec!["sB".to_string()],
                    execution_mode: ExecutionMode::Parallel,
                    depends_on_stages: vec!["g1".to_string()],
                },
            ],
            fail_fast: None,
        }
    }

    #[test]
    fn compiles_fan_out_fan_in_with_expected_dependencies() {
        let graph = compile_plan(&fan_out_plan(), &HashSet::new()).unwrap();
        let reduce_a = Task::reduce_task_id("m1", "sA");
        let reduce_b = Task::reduce_task_id("m1", "sB");
        let b1 = Task::instance_task_id("m1", "b1");
        assert!(graph.tasks[&reduce_a].depends_on.contains(&Task::instance_task_id("m1", "a1")));
        assert!(graph.tasks[&reduce_a].depends_on.contains(&Task::instance_task_id("m1", "a2")));
        assert!(graph.tasks[&b1].depends_on.contains(&reduce_a));
        assert!(graph.tasks.contains_key(&reduce_b));
    }

    #[test]
    fn recompiling_the_same_plan_is_byte_identical() {
        let plan = fan_out_plan();
        let first = compile_plan(&plan, &HashSet::new()).unwrap();
        let second = compile_plan(&plan, &HashSet::new()).unwrap();
        assert_eq!(first.roots, second.roots);
        for (id, task) in &first.tasks {
            assert_eq!(task.depends_on, second.tasks[id].depends_on);
        }
    }

    #[test]
    fn empty_sub_stage_is_rejected() {
        let mut plan = fan_out_plan();
        plan.sub_stages[0].agent_instances.clear();
        let errors = compile_plan(&plan, &HashSet::new()).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileError::EmptySubStage { .. })));
    }

    #[test]
    fn unknown_instance_reference_is_rejected() {
        let mut plan = fan_out_plan();
        plan.sub_stages[0].agent_instances.push("ghost".to_string());
        let errors = compile_plan(&plan, &HashSet::new()).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileError::UnknownInstance { .. })));
    }

    #[test]
    fn a_cycle_between_two_mutually_dependent_stages_is_rejected() {
        let mut plan = fan_out_plan();
        plan.sub_stages[1].depends_on_sub_stages.clear();
        plan.stages[0].depends_on_stages = vec!["g2".to_string()];
        let errors = compile_plan(&plan, &HashSet::new()).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, CompileError::Cycle { .. })));
    }

    #[test]
    fn unknown_tool_is_rejected() {
        let mut plan = fan_out_plan();
        plan.agent_instances[0].allowed_tools = vec!["nonexistent_tool".to_string()];
        let errors = compile_plan(&plan, &HashSet::new()).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, CompileError::UnknownTool { .. })));
    }

    #[test]
    fn sequential_sibling_may_reference_an_earlier_sibling() {
        let mut plan = fan_out_plan();
        plan.sub_stages[0].execution_mode = ExecutionMode::Sequential;
        plan.agent_instances[1].requires_outputs_from = vec!["a1".to_string()];
        let graph = compile_plan(&plan, &HashSet::new()).unwrap();
        let a2 = Task::instance_task_id("m1", "a2");
        assert!(graph.tasks[&a2].depends_on.contains(&Task::instance_task_id("m1", "a1")));
    }

    #[test]
    fn forward_reference_within_a_sub_stage_is_rejected() {
        let mut plan = fan_out_plan();
        plan.agent_instances[0].requires_outputs_from = vec!["a2".to_string()];
        let errors = compile_plan(&plan, &HashSet::new()).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileError::ForwardReference { .. })));
    }
}
