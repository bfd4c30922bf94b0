use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::{ActionQuery, SharedState, start_action};
use super::hub::EnvironmentView;
use super::models::{DeploymentStatus, EnvironmentKey};
use super::replay::ReplaySubscription;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    /// Fast first pass from persisted state.
    Initial {
        environments: Vec<EnvironmentView>,
        total: usize,
        checked_at: DateTime<Utc>,
    },
    Update {
        environments: Vec<EnvironmentView>,
        total: usize,
        checked_at: DateTime<Utc>,
    },
    Log {
        deployment_id: i64,
        text: String,
    },
    Complete {
        deployment_id: i64,
        success: bool,
    },
    ActionStarted {
        action_id: String,
        project: String,
        name: String,
        action: String,
        command: String,
    },
    ActionOutput {
        action_id: String,
        line: String,
    },
    ActionComplete {
        action_id: String,
        success: bool,
        output: String,
    },
    Ping,
    Pong,
    Error {
        message: String,
    },
}

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Recompute the environment list now.
    Refresh,
    Ping,
}

/// Serialize a message into a wire frame.
pub fn encode(msg: &WsMessage) -> String {
    match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize WsMessage");
            r#"{"type":"error","data":{"message":"serialization failed"}}"#.to_string()
        }
    }
}

// ── Status channel ───────────────────────────────────────────────────

pub async fn status_ws(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_status_socket(socket, state))
}

async fn handle_status_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, receiver) = socket.split();
    let rx = state.hub.subscribe();

    match state.hub.fast_snapshot().await {
        Ok(snapshot) => {
            let frame = encode(&snapshot.initial_message(Utc::now()));
            if sender.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to build initial snapshot"),
    }
    if let Some(frame) = live_update(&state).await
        && sender.send(Message::Text(frame.into())).await.is_err()
    {
        return;
    }

    let on_client = |msg: ClientMessage| {
        let state = Arc::clone(&state);
        async move {
            match msg {
                ClientMessage::Refresh => live_update(&state).await,
                ClientMessage::Ping => Some(encode(&WsMessage::Pong)),
            }
        }
    };
    run_socket_loop(sender, receiver, Some(rx), on_client).await;
}

/// Full recomputation for a subscribed client. A changed snapshot goes out
/// on the broadcast, which this client also receives; an unchanged one is
/// returned for sending straight to the client. Either way the client sees
/// exactly one `update`.
async fn live_update(state: &SharedState) -> Option<String> {
    match state.hub.full_snapshot().await {
        Ok(snapshot) => {
            let frame = encode(&snapshot.update_message(Utc::now()));
            if state.hub.publish_if_changed(snapshot).await {
                None
            } else {
                Some(frame)
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to build status snapshot");
            None
        }
    }
}

// ── Deployment-log channel ───────────────────────────────────────────

pub async fn deployment_ws(
    ws: WebSocketUpgrade,
    Path(deployment_id): Path<i64>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_deployment_socket(socket, state, deployment_id))
}

async fn handle_deployment_socket(socket: WebSocket, state: SharedState, deployment_id: i64) {
    if let Some(subscription) = state.logs.subscribe(deployment_id) {
        stream_replay(socket, subscription).await;
        return;
    }

    // Not in flight: replay the persisted log in one frame.
    let (mut sender, _receiver) = socket.split();
    let frames = match state
        .db
        .call(move |db| db.get_deployment(deployment_id))
        .await
    {
        Ok(Some(record)) => vec![
            WsMessage::Log {
                deployment_id,
                text: record.log_output.unwrap_or_default(),
            },
            WsMessage::Complete {
                deployment_id,
                success: record.status == DeploymentStatus::Success,
            },
        ],
        Ok(None) => vec![WsMessage::Error {
            message: format!("Deployment {} not found", deployment_id),
        }],
        Err(e) => vec![WsMessage::Error {
            message: e.to_string(),
        }],
    };
    for msg in frames {
        if sender.send(Message::Text(encode(&msg).into())).await.is_err() {
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

// ── Action channel ───────────────────────────────────────────────────

pub async fn action_ws(
    ws: WebSocketUpgrade,
    Path((project, name, action)): Path<(String, String, String)>,
    Query(query): Query<ActionQuery>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let key = EnvironmentKey::new(project, name);
        match start_action(&state, &key, &action, query.args.as_deref()).await {
            Ok(ticket) => stream_replay(socket, ticket.frames).await,
            Err(e) => {
                let (mut sender, _receiver) = socket.split();
                let frame = encode(&WsMessage::Error {
                    message: e.to_string(),
                });
                let _ = sender.send(Message::Text(frame.into())).await;
                let _ = sender.send(Message::Close(None)).await;
            }
        }
    })
}

/// Backlog first, then live frames until the stream finishes.
async fn stream_replay(socket: WebSocket, subscription: ReplaySubscription) {
    let (mut sender, receiver) = socket.split();
    for frame in subscription.backlog {
        if sender.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }
    if subscription.live.is_none() {
        let _ = sender.send(Message::Close(None)).await;
        return;
    }
    let on_client = |msg: ClientMessage| async move {
        match msg {
            ClientMessage::Ping => Some(encode(&WsMessage::Pong)),
            ClientMessage::Refresh => None,
        }
    };
    run_socket_loop(sender, receiver, subscription.live, on_client).await;
}

// ── Socket loop ──────────────────────────────────────────────────────

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines broadcast forwarding, client message handling, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection
/// is considered dead and the loop exits. The loop also ends when the
/// broadcast channel closes.
async fn run_socket_loop<F, Fut>(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: Option<broadcast::Receiver<String>>,
    mut on_client: F,
) where
    F: FnMut(ClientMessage) -> Fut,
    Fut: Future<Output = Option<String>>,
{
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("WebSocket pong timeout, closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                if sender.send(Message::Text(encode(&WsMessage::Ping).into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Broadcast forwarding ────────────────────────────────
            result = recv(&mut rx) => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "WebSocket subscriber lagged");
                        continue;
                    }
                }
            }

            // ── Client messages (pong, refresh, close) ──────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let Ok(msg) = serde_json::from_str::<ClientMessage>(text.as_str()) else {
                            continue;
                        };
                        if let Some(reply) = on_client(msg).await
                            && sender.send(Message::Text(reply.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

async fn recv(rx: &mut Option<broadcast::Receiver<String>>) -> Result<String, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
