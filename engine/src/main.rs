use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;

use expedition_core::agent_runtime::AgentEvent;
use expedition_core::{Config, ThreadStore, ToolRegistry};
use expedition_server::{serve, AppState};
use expedition_types::{Decision, Message};

#[derive(Parser, Debug)]
#[command(name = "expedition-engine")]
#[command(about = "Headless HITL conversation engine and mission orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/WS server (the C1-C5 stack behind `/threads/{id}/hitl` and `/missions`).
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Drive a single turn to completion without a socket, auto-approving any interrupt.
    /// Useful for scripting and smoke tests.
    Run {
        prompt: String,
        #[arg(long)]
        thread_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { hostname, port, state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let state = build_state(&state_dir).await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);
            serve(addr, state).await?;
        }
        Command::Run { prompt, thread_id } => {
            let state = build_state_in_memory().await?;
            let thread_id = thread_id.unwrap_or_else(|| "cli".to_string());
            let reply = run_oneshot(&state, &thread_id, prompt).await?;
            println!("{reply}");
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("EXPEDITION_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".expedition")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    tracing::info!("starting expedition-engine on http://{addr}");
    tracing::info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display()
    );
}

fn seed_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(expedition_core::agent_runtime::ToolSpec::new(
        "create_research_plan",
        true,
        vec![
            expedition_types::AllowedDecision::Approve,
            expedition_types::AllowedDecision::Edit,
            expedition_types::AllowedDecision::Reject,
        ],
        |args| format!("propose a research plan with arguments {args}"),
    ));
    tools
}

async fn build_state(state_dir: &PathBuf) -> anyhow::Result<AppState> {
    let config = Config::load(Some(&state_dir.join("config.json"))).await?;
    let threads = Arc::new(ThreadStore::open(state_dir.join("threads")).await?);
    Ok(AppState::new(config, threads, seed_tools()))
}

async fn build_state_in_memory() -> anyhow::Result<AppState> {
    let config = Config::load(None).await?;
    let threads = Arc::new(ThreadStore::in_memory());
    Ok(AppState::new(config, threads, seed_tools()))
}

/// Drives one turn outside of a socket: appends the prompt, streams the adapter, and
/// auto-approves any interrupt the scripted backend raises (there is no human attached).
async fn run_oneshot(state: &AppState, thread_id: &str, prompt: String) -> anyhow::Result<String> {
    state.threads.append_message(thread_id, Message::user(prompt)).await?;
    let messages = state.threads.load_messages(thread_id).await;
    let checkpoint = state.threads.load_checkpoint(thread_id).await;

    let mut assistant_text = String::new();
    let mut events = state.agent_runtime.stream_turn(thread_id.to_string(), messages, checkpoint);
    loop {
        let Some(event) = events.next().await else { break };
        match event {
            AgentEvent::Thinking => {}
            AgentEvent::ContentDelta { text } => assistant_text.push_str(&text),
            AgentEvent::Interrupt { .. } => {
                events = state
                    .agent_runtime
                    .resume_turn(thread_id.to_string(), Decision::Approve);
            }
            AgentEvent::Done => break,
            AgentEvent::Error { reason } => {
                assistant_text.push_str(&format!("[error: {reason}]"));
                break;
            }
        }
    }

    state
        .threads
        .append_message(thread_id, Message::assistant(assistant_text.clone()))
        .await?;
    state
        .threads
        .save_checkpoint(thread_id, state.agent_runtime.get_state(thread_id).await)
        .await?;
    Ok(assistant_text)
}
