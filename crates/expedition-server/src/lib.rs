pub mod hitl_session;
pub mod http;
pub mod state;
pub mod task_executor;

pub use hitl_session::run_session;
pub use http::{app_router, serve};
pub use state::{AppState, MissionRegistry};
pub use task_executor::ScriptedTaskExecutor;
