use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    Json,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broadcast::Outbound;
use crate::codec::SESSION_CLOSED_CODE;
use crate::registry::{SessionInfo, ViewerHandle, ViewerMeta};
use crate::session::Inbound;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.registry.len(),
    })
}

pub(super) async fn session_list(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list())
}

pub(super) async fn session_close(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let uuid = Uuid::parse_str(&id).map_err(|_| ApiError::SessionNotFound(id.clone()))?;
    state.registry.close(&uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct AttachParams {
    name: Option<String>,
    agent: Option<String>,
}

/// Attach happens before the upgrade so refusals surface as HTTP errors.
pub(super) async fn session_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<AttachParams>,
) -> Result<Response, ApiError> {
    let meta = ViewerMeta {
        display_name: params.name.filter(|n| !n.trim().is_empty()),
        agent: params.agent,
    };
    let viewer = state.registry.attach(&id, meta).await?;
    let max_frame = state.registry.config().uploads.max_bytes + 64 * 1024;
    Ok(ws
        .max_message_size(max_frame)
        .on_upgrade(move |socket| handle_session_ws(socket, viewer, state)))
}

async fn send_outbound(ws_tx: &mut SplitSink<WebSocket, Message>, item: Outbound) -> Result<(), axum::Error> {
    match item {
        Outbound::Output(data) => ws_tx.send(Message::Binary(data)).await,
        Outbound::Text(text) => ws_tx.send(Message::Text(text.as_ref().into())).await,
    }
}

/// Send whatever is already queued for this viewer, then a close frame.
async fn close_with(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    viewer: &mut ViewerHandle,
    code: u16,
    reason: &'static str,
) {
    while let Ok(item) = viewer.rx.try_recv() {
        if send_outbound(ws_tx, item).await.is_err() {
            return;
        }
    }
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}

async fn handle_session_ws(socket: WebSocket, mut viewer: ViewerHandle, state: AppState) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let session_id = viewer.session().id;
    let viewer_id = viewer.info().id;
    let kicked = viewer.kicked();
    let closing = viewer.session().closing_token();
    tracing::info!(session = %session_id, viewer = viewer_id, "viewer connected");

    if *shutdown_rx.borrow() {
        close_with(&mut ws_tx, &mut viewer, close_code::NORMAL, "server shutting down").await;
        return;
    }

    loop {
        tokio::select! {
            item = viewer.rx.recv() => {
                match item {
                    Some(item) => {
                        if send_outbound(&mut ws_tx, item).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => viewer.dispatch(Inbound::Binary(data)).await,
                    Some(Ok(Message::Text(text))) => viewer.dispatch(Inbound::Text(text.as_str().to_owned())).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(session = %session_id, viewer = viewer_id, error = %e, "websocket read failed");
                        break;
                    }
                }
            }

            _ = kicked.cancelled(), if !closing.is_cancelled() => {
                tracing::warn!(session = %session_id, viewer = viewer_id, "viewer dropped: outbound queue overflow");
                close_with(&mut ws_tx, &mut viewer, close_code::POLICY, "viewer too slow").await;
                break;
            }

            _ = closing.cancelled() => {
                // A drain keeps the session resumable, so viewers may come back.
                if state.registry.is_draining() || state.shutdown.is_shutting_down() {
                    close_with(&mut ws_tx, &mut viewer, close_code::NORMAL, "server shutting down").await;
                } else {
                    close_with(&mut ws_tx, &mut viewer, SESSION_CLOSED_CODE, "session closed").await;
                }
                break;
            }

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(session = %session_id, viewer = viewer_id, "closing viewer for shutdown");
                    close_with(&mut ws_tx, &mut viewer, close_code::NORMAL, "server shutting down").await;
                    break;
                }
            }
        }
    }

    tracing::info!(session = %session_id, viewer = viewer_id, "viewer disconnected");
    // Dropping `viewer` detaches it; dropping `_guard` releases the shutdown slot.
}
