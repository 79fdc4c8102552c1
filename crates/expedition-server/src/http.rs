use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use expedition_orchestrator::scheduler::MissionRunner;
use expedition_orchestrator::{compile_plan, OutputStore};
use expedition_types::{MissionEvent, MissionPlan, MissionStatus};

use crate::hitl_session::run_session;
use crate::state::AppState;
use crate::task_executor::ScriptedTaskExecutor;

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/threads/:thread_id/hitl", get(hitl_ws))
        .route("/missions", post(start_mission))
        .route("/missions/:mission_id", get(mission_status))
        .route("/missions/:mission_id/events", get(mission_events))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "expedition-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

async fn hitl_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state, thread_id))
}

/// Compiles and runs an approved mission plan in the background, returning immediately —
/// the caller polls `/missions/{id}` or subscribes to `/missions/{id}/events` (§12).
async fn start_mission(
    State(state): State<AppState>,
    Json(plan): Json<MissionPlan>,
) -> Result<Json<Value>, StatusCode> {
    let known_tools: std::collections::HashSet<String> = plan
        .agent_instances
        .iter()
        .flat_map(|i| i.allowed_tools.clone())
        .collect();
    let graph = match compile_plan(&plan, &known_tools) {
        Ok(graph) => graph,
        Err(errors) => {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Ok(Json(json!({"error": "plan validation failed", "details": messages})));
        }
    };

    let mission_id = plan.mission_id.clone();
    state.missions.set(&mission_id, MissionStatus::Running).await;

    let events = (*state.events).clone();
    let missions = state.missions.clone();
    let config = state.config.clone();
    let worker_pool_size = config.worker_pool_size;
    let default_task_timeout_seconds = config.default_task_timeout_seconds;
    tokio::spawn(async move {
        let runner = MissionRunner::new(
            Arc::new(ScriptedTaskExecutor),
            Arc::new(OutputStore::new()),
            events,
            tokio_util::sync::CancellationToken::new(),
            worker_pool_size,
        );
        let status = runner.run(graph, &plan, default_task_timeout_seconds).await;
        missions.set(&mission_id, status).await;
    });

    Ok(Json(json!({"mission_id": plan.mission_id, "status": "running"})))
}

async fn mission_status(
    State(state): State<AppState>,
    Path(mission_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let status = state.missions.get(&mission_id).await.ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({"mission_id": mission_id, "status": status})))
}

async fn mission_events(
    State(state): State<AppState>,
    Path(mission_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.events.subscribe();
    let filter_mission_id = mission_id.clone();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) if event.mission_id() == filter_mission_id => {
            let is_terminal = matches!(
                event,
                MissionEvent::MissionSucceeded { .. } | MissionEvent::MissionFailed { .. }
            );
            Some(Ok(Event::default()
                .data(serde_json::to_string(&event).unwrap_or_default())
                .event(if is_terminal { "mission_finished" } else { "mission_progress" })))
        }
        _ => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
