//! WebSocket handler: admission and transport adaptation.
//!
//! DESIGN
//! ======
//! Admission is settled before the upgrade: the one-time ticket names the
//! user, and the canvas must be one they own or have been granted. Rejected
//! requests get a plain HTTP status and never reach the registry.
//!
//! After the upgrade the socket is split and adapted to text frames, then
//! handed to `Participant::run`, which owns both directions from there on.
//!
//! LIFECYCLE
//! =========
//! 1. `?ticket=` consumed → user id (401 when missing, unknown or expired)
//! 2. Canvas loaded with access check (404 when absent or not shared)
//! 3. Upgrade → `Registry::admit` → participant loops
//! 4. Close or read error → participant removed → socket closed

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt, future};
use tracing::{error, info, warn};

use crate::document::CanvasId;
use crate::services::participant::ConnectionError;
use crate::services::store::{CanvasRecord, UserId};
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Path(canvas_id): Path<CanvasId>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ticket) = params.get("ticket") else {
        return (StatusCode::UNAUTHORIZED, "ticket required").into_response();
    };

    let user_id = match state.store.consume_ws_ticket(ticket).await {
        Ok(Some(uid)) => uid,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response(),
        Err(e) => {
            error!(error = %e, "ws ticket validation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "ticket validation error").into_response();
        }
    };

    let snapshot = match state.store.load_canvas(user_id, canvas_id).await {
        Ok(Some(record)) => record,
        Ok(None) => return (StatusCode::NOT_FOUND, "canvas not found").into_response(),
        Err(e) => {
            error!(error = %e, %canvas_id, "canvas load failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "canvas load error").into_response();
        }
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, user_id, snapshot))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(socket: WebSocket, state: AppState, user_id: UserId, snapshot: CanvasRecord) {
    let canvas_id = snapshot.canvas_id;
    let participant = match state.registry.admit(user_id, snapshot).await {
        Ok(participant) => participant,
        Err(e) => {
            warn!(error = %e, %canvas_id, %user_id, "ws: admission refused");
            return;
        }
    };
    info!(%canvas_id, %user_id, participant_id = %participant.id(), "ws: client connected");

    let (sink, stream) = socket.split();
    let inbound = stream
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| future::ready(inbound_text(frame)));
    let outbound = sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text.into()))));

    participant.run(inbound, outbound).await;
}

/// Text payload of one inbound frame. Control frames carry none.
fn inbound_text(frame: Result<Message, axum::Error>) -> Option<Result<String, ConnectionError>> {
    match frame {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
        Err(e) => Some(Err(ConnectionError::Transport(e.to_string()))),
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
