use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use expedition_core::agent_runtime::AgentEvent;
use expedition_core::interrupt_registry::WaitError;
use expedition_types::{ClientFrame, Decision, InterruptData, Interrupt, Message, ServerFrame};

use crate::state::AppState;

/// Drives one socket's worth of the conversation engine (C2). The reader loop below never
/// blocks on the runner (I8): `send_message` spawns the runner as an independent task and
/// keeps reading; `decision` frames are handed straight to C1 without touching the runner.
pub async fn run_session(socket: WebSocket, state: AppState, thread_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(64);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else { continue };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    if let Some(interrupt) = state.threads.pending_interrupt(&thread_id).await {
        replay_interrupt(&out_tx, &interrupt).await;
    }

    let runner_active = Arc::new(AtomicBool::new(false));
    let mut runner_handle: Option<JoinHandle<()>> = None;

    while let Some(Ok(message)) = stream.next().await {
        let WsMessage::Text(text) = message else { continue };
        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = out_tx.send(ServerFrame::error(format!("malformed frame: {err}"))).await;
                continue;
            }
        };

        match frame {
            ClientFrame::SendMessage { content } => {
                if runner_active.swap(true, Ordering::SeqCst) {
                    let _ = out_tx.send(ServerFrame::error("already streaming")).await;
                    continue;
                }
                let handle = tokio::spawn(run_turn(
                    state.clone(),
                    thread_id.clone(),
                    content,
                    out_tx.clone(),
                    runner_active.clone(),
                ));
                runner_handle = Some(handle);
            }
            ClientFrame::Decision { decisions } => {
                let Some(decision) = decisions.into_iter().next() else {
                    let _ = out_tx.send(ServerFrame::error("empty decision list")).await;
                    continue;
                };
                match state.interrupts.deliver(&thread_id, decision).await {
                    Ok(()) => {}
                    Err(err) => {
                        let _ = out_tx.send(ServerFrame::error(format!("{err:?}"))).await;
                    }
                }
            }
        }
    }

    // Disconnect: cancel whatever is in flight so the runner never writes a partial
    // assistant message after the socket is gone (§4.2).
    if let Some(handle) = runner_handle {
        handle.abort();
    }
    state.interrupts.cancel(&thread_id).await;
    drop(out_tx);
    let _ = writer.await;
}

async fn replay_interrupt(out_tx: &mpsc::Sender<ServerFrame>, interrupt: &Interrupt) {
    let _ = out_tx
        .send(ServerFrame::Interrupt {
            interrupt_data: InterruptData {
                action_requests: interrupt.action_requests.clone(),
                allowed_decisions: interrupt.allowed_decisions.clone(),
            },
        })
        .await;
    let _ = out_tx
        .send(ServerFrame::WaitingForDecision {
            message: "a decision from a previous connection is still pending".to_string(),
        })
        .await;
}

/// The runner activity (§4.2): drives one turn end to end, parking on `C1.wait` whenever
/// the adapter raises an interrupt, and exits without persisting a partial assistant
/// message if cancelled mid-wait.
async fn run_turn(
    state: AppState,
    thread_id: String,
    content: String,
    out_tx: mpsc::Sender<ServerFrame>,
    runner_active: Arc<AtomicBool>,
) {
    let _ = state.threads.append_message(&thread_id, Message::user(content)).await;
    let messages = state.threads.load_messages(&thread_id).await;
    let checkpoint = state.threads.load_checkpoint(&thread_id).await;

    let mut assistant_text = String::new();
    let mut events = state.agent_runtime.stream_turn(thread_id.clone(), messages, checkpoint);

    loop {
        let Some(event) = events.next().await else { break };
        match event {
            AgentEvent::Thinking => {
                let _ = out_tx.send(ServerFrame::Thinking).await;
            }
            AgentEvent::ContentDelta { text } => {
                assistant_text.push_str(&text);
                let _ = out_tx.send(ServerFrame::Content { content: text }).await;
            }
            AgentEvent::Interrupt { interrupt } => {
                replay_interrupt(&out_tx, &interrupt).await;
                let _ = state
                    .threads
                    .set_pending_interrupt(&thread_id, Some(interrupt.clone()))
                    .await;
                let _ = state
                    .threads
                    .save_checkpoint(&thread_id, state.agent_runtime.get_state(&thread_id).await)
                    .await;

                let decision = match state
                    .interrupts
                    .wait(&thread_id, &interrupt.allowed_decisions, interrupt.deadline_ms)
                    .await
                {
                    Ok(decision) => decision,
                    Err(WaitError::Timeout) => Decision::timeout(),
                    Err(WaitError::Cancelled) => {
                        runner_active.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(WaitError::Busy) => Decision::timeout(),
                };
                let _ = state.threads.set_pending_interrupt(&thread_id, None).await;
                let _ = out_tx
                    .send(ServerFrame::Resuming { message: "resuming".to_string() })
                    .await;
                events = state.agent_runtime.resume_turn(thread_id.clone(), decision);
            }
            AgentEvent::Done => break,
            AgentEvent::Error { reason } => {
                let _ = out_tx.send(ServerFrame::Error { error: reason }).await;
                break;
            }
        }
    }

    let _ = state
        .threads
        .append_message(&thread_id, Message::assistant(assistant_text))
        .await;
    let _ = state
        .threads
        .save_checkpoint(&thread_id, state.agent_runtime.get_state(&thread_id).await)
        .await;
    let _ = out_tx.send(ServerFrame::Done).await;
    runner_active.store(false, Ordering::SeqCst);
}
