//! HTTP and WebSocket endpoints for the debug injection proxy.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use crate::debug::{DebugChannel, DomQueryResult, Link};

use super::error::ApiError;
use super::AppState;

#[derive(Clone, Copy)]
enum Side {
    Browser,
    Agent,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Side::Browser => "browser",
            Side::Agent => "agent",
        }
    }
}

pub(super) async fn browser_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay(socket, state, id, Side::Browser))
}

pub(super) async fn agent_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay(socket, state, id, Side::Agent))
}

fn connect(channel: &DebugChannel, side: Side) -> Link {
    match side {
        Side::Browser => channel.connect_browser(),
        Side::Agent => channel.connect_agent(),
    }
}

async fn relay(socket: WebSocket, state: AppState, id: String, side: Side) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let channel: Arc<DebugChannel> = state.debug.channel(&id);
    let mut link = connect(&channel, side);
    tracing::debug!(channel = %id, side = side.as_str(), conn = link.conn, "debug endpoint connected");

    if !*shutdown_rx.borrow() {
        loop {
            tokio::select! {
                out = link.rx.recv() => {
                    match out {
                        Some(text) => {
                            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match side {
                            Side::Browser => channel.ingest_browser(text.as_str()),
                            Side::Agent => channel.ingest_agent(text.as_str()),
                        },
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => continue,
                    }
                }

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    if *shutdown_rx.borrow() {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "server shutting down".into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
        let _ = ws_tx.flush().await;
    }

    match side {
        Side::Browser => channel.disconnect_browser(link.conn),
        Side::Agent => channel.disconnect_agent(link.conn),
    }
    drop(channel);
    state.debug.release(&id);
    tracing::debug!(channel = %id, side = side.as_str(), "debug endpoint disconnected");
}

pub(super) async fn events(State(state): State<AppState>, Path(id): Path<String>) -> Json<Vec<Value>> {
    Json(state.debug.get(&id).map(|c| c.backlog()).unwrap_or_default())
}

#[derive(Deserialize)]
pub(super) struct QueryRequest {
    selector: String,
    timeout_ms: Option<u64>,
}

pub(super) async fn query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<DomQueryResult>, ApiError> {
    if req.selector.trim().is_empty() {
        return Err(ApiError::InvalidRequest("selector must not be empty".into()));
    }
    let channel = state.debug.get(&id).ok_or(ApiError::NoBrowser)?;
    let limit = state.registry.config().debug.query_timeout();
    let timeout = req.timeout_ms.map(Duration::from_millis).map_or(limit, |t| t.min(limit));
    let result = channel.query(req.selector, timeout).await?;
    Ok(Json(result))
}
