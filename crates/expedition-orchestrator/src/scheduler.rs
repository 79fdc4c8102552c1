use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use expedition_core::MissionEventBus;
use expedition_types::{
    AgentInstanceSpec, MissionEvent, MissionPlan, MissionStatus, OutputAggregation, OutputRecord,
    Task, TaskGraph, TaskPayload, TaskState,
};

use crate::output_store::OutputStore;
use crate::reduce;

#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("timeout")]
    Timeout,
    #[error("tool `{0}` requires approval but this is a non-interactive instance run")]
    RequiresApproval(String),
    #[error("{0}")]
    Failed(String),
}

/// The agent runtime surface C5 drives for instance tasks (§4.5). This is the
/// non-interactive variant named in the spec: a tool that would normally interrupt must
/// either be auto-approved via `allowed_tools` or the task fails with `RequiresApproval`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute_instance(
        &self,
        mission_id: &str,
        instance: &AgentInstanceSpec,
        previous_outputs: HashMap<String, OutputRecord>,
    ) -> Result<OutputRecord, TaskError>;
}

struct PlanIndex {
    instances: HashMap<String, AgentInstanceSpec>,
    sub_stage_members: HashMap<String, Vec<String>>,
    aggregations: HashMap<String, OutputAggregation>,
    default_task_timeout_seconds: u64,
}

/// Drives one mission's task graph to completion (C5). Owns the scheduler's private
/// state; there is exactly one of these per running mission.
pub struct MissionRunner<E: TaskExecutor + 'static> {
    executor: Arc<E>,
    output_store: Arc<OutputStore>,
    events: MissionEventBus,
    cancellation: CancellationToken,
    worker_pool_size: usize,
}

impl<E: TaskExecutor + 'static> MissionRunner<E> {
    pub fn new(
        executor: Arc<E>,
        output_store: Arc<OutputStore>,
        events: MissionEventBus,
        cancellation: CancellationToken,
        worker_pool_size: usize,
    ) -> Self {
        Self {
            executor,
            output_store,
            events,
            cancellation,
            worker_pool_size: worker_pool_size.max(1),
        }
    }

    pub async fn run(
        &self,
        graph: TaskGraph,
        plan: &MissionPlan,
        default_task_timeout_seconds: u64,
    ) -> MissionStatus {
        let mission_id = graph.mission_id.clone();
        let mut tasks = graph.tasks;
        let dependents = build_dependents(&tasks);
        let mut outstanding: HashMap<String, usize> =
            tasks.iter().map(|(id, t)| (id.clone(), t.depends_on.len())).collect();
        let mut ready: VecDeque<String> = graph.roots.into_iter().collect();
        for id in &ready {
            tasks.get_mut(id).unwrap().state = TaskState::Ready;
        }

        let index = Arc::new(PlanIndex {
            instances: plan
                .agent_instances
                .iter()
                .map(|i| (i.instance_id.clone(), i.clone()))
                .collect(),
            sub_stage_members: plan
                .sub_stages
                .iter()
                .map(|s| (s.sub_stage_id.clone(), s.agent_instances.clone()))
                .collect(),
            aggregations: plan
                .sub_stages
                .iter()
                .map(|s| (s.sub_stage_id.clone(), s.output_aggregation))
                .collect(),
            default_task_timeout_seconds,
        });
        let fail_fast = plan.fail_fast.unwrap_or(true);

        self.events.publish(MissionEvent::MissionStarted { mission_id: mission_id.clone() });

        let (tx, mut rx) = mpsc::channel::<(String, Result<OutputRecord, TaskError>)>(
            self.worker_pool_size.max(1) * 2,
        );
        let mut in_flight = 0usize;
        let mut mission_failed = false;

        loop {
            while in_flight < self.worker_pool_size {
                let Some(task_id) = ready.pop_front() else { break };
                let task = tasks.get_mut(&task_id).unwrap();
                task.state = TaskState::Running;
                self.events.publish(MissionEvent::TaskStarted {
                    mission_id: mission_id.clone(),
                    task_id: task_id.clone(),
                });
                self.spawn_worker(task.clone(), index.clone(), tx.clone());
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let Some((task_id, outcome)) = rx.recv().await else { break };
            in_flight -= 1;

            match outcome {
                Ok(record) => {
                    let store_key = store_key_for(&tasks[&task_id].payload);
                    if self.output_store.put(store_key, record.clone()).await.is_err() {
                        tracing::error!(task_id, "output already recorded; scheduler invariant violated");
                    }
                    tasks.get_mut(&task_id).unwrap().state = TaskState::Succeeded;
                    tasks.get_mut(&task_id).unwrap().result = Some(record);
                    self.events.publish(MissionEvent::TaskSucceeded {
                        mission_id: mission_id.clone(),
                        task_id: task_id.clone(),
                    });
                    for dependent in dependents.get(&task_id).cloned().unwrap_or_default() {
                        let remaining = outstanding.get_mut(&dependent).unwrap();
                        *remaining -= 1;
                        if *remaining == 0 && tasks[&dependent].state == TaskState::Pending {
                            tasks.get_mut(&dependent).unwrap().state = TaskState::Ready;
                            ready.push_back(dependent);
                        }
                    }
                }
                Err(err) => {
                    let task = tasks.get_mut(&task_id).unwrap();
                    task.attempts += 1;
                    let retryable = !matches!(task.payload, TaskPayload::Reduce { .. })
                        && task.attempts < task.max_attempts;
                    if retryable {
                        task.state = TaskState::Ready;
                        ready.push_back(task_id.clone());
                        tracing::info!(task_id, attempts = task.attempts, "retrying failed task");
                        continue;
                    }
                    mission_failed = true;
                    task.state = TaskState::Failed;
                    task.error = Some(err.to_string());
                    self.events.publish(MissionEvent::TaskFailed {
                        mission_id: mission_id.clone(),
                        task_id: task_id.clone(),
                        reason: err.to_string(),
                    });
                    let cancelled = if fail_fast {
                        cancel_all_non_running(&mut tasks, &mut ready)
                    } else {
                        cascade_cancel(&mut tasks, &dependents, &mut ready, vec![task_id.clone()])
                    };
                    for cancelled_id in cancelled {
                        self.events.publish(MissionEvent::TaskCancelled {
                            mission_id: mission_id.clone(),
                            task_id: cancelled_id,
                        });
                    }
                }
            }
        }

        if mission_failed {
            self.events.publish(MissionEvent::MissionFailed {
                mission_id: mission_id.clone(),
                reason: "one or more tasks failed".to_string(),
            });
            MissionStatus::Failed
        } else {
            self.events.publish(MissionEvent::MissionSucceeded { mission_id });
            MissionStatus::Succeeded
        }
    }

    fn spawn_worker(
        &self,
        task: Task,
        index: Arc<PlanIndex>,
        tx: mpsc::Sender<(String, Result<OutputRecord, TaskError>)>,
    ) {
        let executor = self.executor.clone();
        let output_store = self.output_store.clone();
        let cancellation = self.cancellation.clone();
        tokio::spawn(async move {
            let task_id = task.task_id.clone();
            let outcome = tokio::select! {
                _ = cancellation.cancelled() => Err(TaskError::Failed("mission cancelled".to_string())),
                result = execute_one(&task, &index, executor, output_store) => result,
            };
            let _ = tx.send((task_id, outcome)).await;
        });
    }
}

async fn execute_one(
    task: &Task,
    index: &PlanIndex,
    executor: Arc<dyn TaskExecutor>,
    output_store: Arc<OutputStore>,
) -> Result<OutputRecord, TaskError> {
    match &task.payload {
        TaskPayload::Instance { instance_id } => {
            let instance = index
                .instances
                .get(instance_id)
                .expect("plan index built from the same plan as the task graph");
            let mut previous_outputs = HashMap::new();
            for dep in &instance.requires_outputs_from {
                if let Some(record) = output_store.get(dep).await {
                    previous_outputs.insert(dep.clone(), record);
                }
            }
            let timeout_seconds = if instance.timeout_seconds > 0 {
                instance.timeout_seconds
            } else {
                index.default_task_timeout_seconds
            };
            match tokio::time::timeout(
                Duration::from_secs(timeout_seconds),
                executor.execute_instance(&task.task_id, instance, previous_outputs),
            )
            .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(TaskError::Timeout),
            }
        }
        TaskPayload::Reduce { sub_stage_id } => {
            let members = index
                .sub_stage_members
                .get(sub_stage_id)
                .cloned()
                .unwrap_or_default();
            let mut records = Vec::with_capacity(members.len());
            for instance_id in members {
                match output_store.get(&instance_id).await {
                    Some(record) => records.push((instance_id, record)),
                    None => {
                        return Err(TaskError::Failed(format!(
                            "missing output for `{instance_id}` at reduce barrier"
                        )))
                    }
                }
            }
            let aggregation = index.aggregations.get(sub_stage_id).copied().unwrap_or(OutputAggregation::MergeAll);
            Ok(reduce::aggregate(aggregation, &records))
        }
    }
}

fn store_key_for(payload: &TaskPayload) -> String {
    match payload {
        TaskPayload::Instance { instance_id } => instance_id.clone(),
        TaskPayload::Reduce { sub_stage_id } => sub_stage_id.clone(),
    }
}

fn build_dependents(tasks: &HashMap<String, Task>) -> HashMap<String, Vec<String>> {
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for (id, task) in tasks {
        for dep in &task.depends_on {
            dependents.entry(dep.clone()).or_default().push(id.clone());
        }
    }
    dependents
}

/// fail_fast=true: the whole mission aborts — every task not already running is cancelled.
fn cancel_all_non_running(tasks: &mut HashMap<String, Task>, ready: &mut VecDeque<String>) -> Vec<String> {
    let mut cancelled = Vec::new();
    for (id, task) in tasks.iter_mut() {
        if matches!(task.state, TaskState::Pending | TaskState::Ready) {
            task.state = TaskState::Cancelled;
            cancelled.push(id.clone());
        }
    }
    ready.clear();
    cancelled
}

/// fail_fast=false: only the failing task's transitive dependents are cancelled; unrelated
/// branches continue.
fn cascade_cancel(
    tasks: &mut HashMap<String, Task>,
    dependents: &HashMap<String, Vec<String>>,
    ready: &mut VecDeque<String>,
    start: Vec<String>,
) -> Vec<String> {
    let mut cancelled = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut stack = start;
    while let Some(id) = stack.pop() {
        let Some(next) = dependents.get(&id) else { continue };
        for dependent in next {
            if !seen.insert(dependent.clone()) {
                continue;
            }
            if let Some(task) = tasks.get_mut(dependent) {
                if matches!(task.state, TaskState::Pending | TaskState::Ready) {
                    task.state = TaskState::Cancelled;
                    cancelled.push(dependent.clone());
                    ready.retain(|r| r != dependent);
                }
            }
            stack.push(dependent.clone());
        }
    }
    cancelled
}
