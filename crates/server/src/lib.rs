//! The Session Broker (C5): a single WebSocket endpoint fronting per-session
//! state machines (C4), plus a small HTTP surface for health checks and
//! read-only Turn Log retrieval.

pub mod http;
pub mod metrics;
pub mod session;
pub mod state;
pub mod websocket;

pub use http::create_router;
pub use metrics::init_metrics;
pub use session::{Session, SessionRegistry};
pub use state::AppState;
pub use websocket::ws_handler;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session registry is at capacity")]
    AtCapacity,

    #[error("origin not allowed: {0}")]
    OriginRejected(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Persistence(#[from] voice_agent_persistence::PersistenceError),
}

impl From<&ServerError> for axum::http::StatusCode {
    fn from(err: &ServerError) -> Self {
        match err {
            ServerError::SessionNotFound(_) => axum::http::StatusCode::NOT_FOUND,
            ServerError::AtCapacity => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            ServerError::OriginRejected(_) => axum::http::StatusCode::FORBIDDEN,
            ServerError::WebSocket(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::Persistence(_) => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
