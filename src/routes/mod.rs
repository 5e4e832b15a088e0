//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The engine exposes one websocket endpoint per canvas plus two small HTTP
//! endpoints for liveness and engine introspection.

pub mod ws;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/canvas/{id}/ws", get(ws::handle_ws))
        .route("/api/stats", get(stats))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Live sessions, participant counts and autosave counters.
async fn stats(State(state): State<AppState>) -> Response {
    match state.registry.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "registry stats unavailable");
            (StatusCode::INTERNAL_SERVER_ERROR, "registry unavailable").into_response()
        }
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
