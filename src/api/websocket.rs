//! WebSocket push channel for job status.
//!
//! Protocol, per connection:
//! 1. Client opens `GET /ws/jobs/:id` — job must exist, or the upgrade is
//!    refused with 404.
//! 2. Server sends `connected`, then a `status_update` carrying the
//!    catch-up snapshot.
//! 3. One `status_update` per stage transition thereafter.
//! 4. Exactly one `final_status` when the job reaches a terminal stage,
//!    then the server closes.
//!
//! Pings go out on the heartbeat interval; a send failure of any kind
//! ends the session.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::config::HEARTBEAT_INTERVAL;
use crate::core_state::CoreState;
use crate::db::repository::job as ledger;
use crate::models::{Job, StatusSnapshot};

/// Server-to-client messages on the push channel.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    Connected {
        job_id: Uuid,
    },
    StatusUpdate {
        #[serde(flatten)]
        snapshot: StatusSnapshot,
    },
    FinalStatus {
        #[serde(flatten)]
        snapshot: StatusSnapshot,
    },
}

/// WebSocket upgrade handler for `GET /ws/jobs/:id`.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(ctx): State<ApiContext>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let core = ctx.core.clone();
    let job = tokio::task::spawn_blocking(move || core.with_db(|c| ledger::get_job(c, &job_id)))
        .await
        .map_err(|e| ApiError::Internal(format!("ws lookup task: {e}")))??
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id} not found")))?;

    tracing::info!(job_id = %job_id, "WebSocket upgrade accepted");
    let core = ctx.core.clone();
    Ok(ws.on_upgrade(move |socket| handle_ws(socket, core, job)))
}

async fn handle_ws(socket: WebSocket, core: Arc<CoreState>, job: Job) {
    let job_id = job.id;
    let (mut sink, mut stream) = socket.split();

    // Subscribe before sending anything: snapshot + receiver come from one
    // lock, so no transition can fall between the catch-up and the stream.
    let (catchup, mut rx) = core.broker().subscribe(StatusSnapshot::from_job(&job));

    if !send_msg(&mut sink, &WsServerMessage::Connected { job_id }).await {
        return;
    }
    if catchup.is_terminal() {
        // Late subscriber to a finished job: final status and out
        send_msg(&mut sink, &WsServerMessage::FinalStatus { snapshot: catchup }).await;
        let _ = sink.close().await;
        return;
    }
    if !send_msg(
        &mut sink,
        &WsServerMessage::StatusUpdate {
            snapshot: catchup,
        },
    )
    .await
    {
        return;
    }

    // The job may have finished between the upgrade's ledger read and our
    // subscribe, in which case its channel was already retired and no event
    // will ever arrive. A terminal stage is written to the ledger before
    // the final publish, so one verification read closes the window.
    if let Some(snapshot) = ledger_snapshot(&core, job_id).await {
        if snapshot.is_terminal() {
            send_msg(&mut sink, &WsServerMessage::FinalStatus { snapshot }).await;
            let _ = sink.close().await;
            return;
        }
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Some(snapshot) = latest_snapshot(&core, job_id).await else {
                            break;
                        };
                        // The snapshot may be ahead of the event that woke
                        // us; both paths stay monotonic either way
                        let _ = event;
                        if snapshot.is_terminal() {
                            send_msg(&mut sink, &WsServerMessage::FinalStatus { snapshot }).await;
                            break;
                        }
                        if !send_msg(&mut sink, &WsServerMessage::StatusUpdate { snapshot }).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(job_id = %job_id, missed, "WS receiver lagged, resyncing");
                        let Some(snapshot) = latest_snapshot(&core, job_id).await else {
                            break;
                        };
                        let terminal = snapshot.is_terminal();
                        let msg = if terminal {
                            WsServerMessage::FinalStatus { snapshot }
                        } else {
                            WsServerMessage::StatusUpdate { snapshot }
                        };
                        if !send_msg(&mut sink, &msg).await || terminal {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Channel retired without us seeing the final event
                        // (buffer drained): the ledger has the answer
                        if let Some(snapshot) = latest_snapshot(&core, job_id).await {
                            send_msg(&mut sink, &WsServerMessage::FinalStatus { snapshot }).await;
                        }
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pongs and client chatter are ignored
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sink.close().await;
    tracing::debug!(job_id = %job_id, "WebSocket session ended");
}

async fn send_msg(sink: &mut SplitSink<WebSocket, Message>, msg: &WsServerMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(j) => j,
        Err(_) => return false,
    };
    sink.send(Message::Text(json)).await.is_ok()
}

/// Current snapshot from the broker, or from the ledger once the job's
/// channel has been retired.
async fn latest_snapshot(core: &Arc<CoreState>, job_id: Uuid) -> Option<StatusSnapshot> {
    if let Some(snapshot) = core.broker().snapshot(&job_id) {
        return Some(snapshot);
    }
    ledger_snapshot(core, job_id).await
}

/// Snapshot read straight from the ledger, bypassing the broker.
async fn ledger_snapshot(core: &Arc<CoreState>, job_id: Uuid) -> Option<StatusSnapshot> {
    let core = core.clone();
    let job = tokio::task::spawn_blocking(move || core.with_db(|c| ledger::get_job(c, &job_id)))
        .await
        .ok()?
        .ok()??;
    Some(StatusSnapshot::from_job(&job))
}
