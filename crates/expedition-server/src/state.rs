use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use expedition_core::{
    AgentRuntimeAdapter, CancellationRegistry, Config, InterruptRegistry, MissionEventBus,
    ScriptedAgentBackend, SharedThreadStore, ToolRegistry,
};
use expedition_types::MissionStatus;

/// Tracks the most recently observed status of every mission, for `GET /missions/{id}`
/// polling independent of the SSE stream — mirroring `tandem-server`'s `RunRegistry`.
#[derive(Default)]
pub struct MissionRegistry {
    statuses: RwLock<HashMap<String, MissionStatus>>,
}

impl MissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, mission_id: impl Into<String>, status: MissionStatus) {
        self.statuses.write().await.insert(mission_id.into(), status);
    }

    pub async fn get(&self, mission_id: &str) -> Option<MissionStatus> {
        self.statuses.read().await.get(mission_id).copied()
    }
}

/// Shared state handed to every `axum` handler (the teacher's `AppState` pattern).
#[derive(Clone)]
pub struct AppState {
    pub threads: SharedThreadStore,
    pub interrupts: Arc<InterruptRegistry>,
    pub cancellations: Arc<CancellationRegistry>,
    pub events: Arc<MissionEventBus>,
    pub config: Arc<Config>,
    pub tools: Arc<ToolRegistry>,
    pub agent_runtime: Arc<AgentRuntimeAdapter<ScriptedAgentBackend>>,
    pub missions: Arc<MissionRegistry>,
}

impl AppState {
    pub fn new(config: Config, threads: SharedThreadStore, tools: ToolRegistry) -> Self {
        let agent_runtime = AgentRuntimeAdapter::new(ScriptedAgentBackend, config.interrupt_deadline_seconds);
        let events = MissionEventBus::new(config.event_subscriber_buffer);
        Self {
            threads,
            interrupts: Arc::new(InterruptRegistry::new()),
            cancellations: Arc::new(CancellationRegistry::new()),
            events: Arc::new(events),
            config: Arc::new(config),
            tools: Arc::new(tools),
            agent_runtime: Arc::new(agent_runtime),
            missions: Arc::new(MissionRegistry::new()),
        }
    }
}
