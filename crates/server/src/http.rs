//! HTTP surface alongside the WebSocket endpoint: liveness/readiness probes
//! and read-only Turn Log retrieval.

use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use voice_agent_core::Turn;

use crate::metrics::metrics_handler;
use crate::state::AppState;
use crate::websocket::ws_handler;
use crate::ServerError;

pub fn create_router(state: AppState) -> Router {
    let cors_layer = build_cors_layer(&state.config.server.origin_allowlist);
    let ws_path = state.config.server.ws_path.clone();

    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/sessions/:id/turns", get(get_session_turns))
        .route("/api/turns/:turn_id", get(get_turn))
        .route(&ws_path, get(ws_handler))
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_cors_layer(origin_allowlist: &[String]) -> CorsLayer {
    if origin_allowlist.is_empty() {
        return CorsLayer::new().allow_methods([Method::GET]);
    }

    let origins: Vec<HeaderValue> = origin_allowlist
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new().allow_methods([Method::GET]).allow_origin(origins)
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.registry.count() <= state.config.server.max_sessions {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

async fn get_session_turns(State(state): State<AppState>, Path(session_id): Path<String>) -> impl IntoResponse {
    match state.turn_log.get_session(&session_id).await {
        Ok(turns) => Json::<Vec<Turn>>(turns).into_response(),
        Err(e) => persistence_error_response(e),
    }
}

async fn get_turn(State(state): State<AppState>, Path(turn_id): Path<String>) -> impl IntoResponse {
    match state.turn_log.get_turn(&turn_id).await {
        Ok(Some(turn)) => Json(turn).into_response(),
        Ok(None) => {
            let err = ServerError::SessionNotFound(turn_id);
            (StatusCode::from(&err), Json(ErrorBody { error: err.to_string() })).into_response()
        },
        Err(e) => persistence_error_response(e),
    }
}

fn persistence_error_response(e: voice_agent_persistence::PersistenceError) -> axum::response::Response {
    let err = ServerError::from(e);
    (StatusCode::from(&err), Json(ErrorBody { error: err.to_string() })).into_response()
}
