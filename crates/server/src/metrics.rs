//! Prometheus metrics: a process-wide recorder installed once at startup and
//! scraped over the ambient `/metrics` HTTP route (spec §6 ambient surface),
//! grounded on the teacher's own `init_metrics`/`metrics_handler` pairing.

use std::sync::OnceLock;

use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the process-wide Prometheus recorder. Must be called once,
/// before any `metrics::counter!`/`histogram!` call site runs, so call this
/// ahead of router construction in `main`.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    let _ = RECORDER.set(handle.clone());
    handle
}

/// Renders the latest scrape. Returns an empty body if `init_metrics` was
/// never called (e.g. in a test binary that never starts the server).
pub async fn metrics_handler() -> impl IntoResponse {
    RECORDER.get().map(PrometheusHandle::render).unwrap_or_default()
}

pub fn record_session_connected() {
    metrics::counter!("voice_agent_sessions_connected_total").increment(1);
}

pub fn record_turn_completed(duration_ms: u64, interrupted: bool) {
    if interrupted {
        metrics::counter!("voice_agent_turns_interrupted_total").increment(1);
    } else {
        metrics::counter!("voice_agent_turns_completed_total").increment(1);
    }
    metrics::histogram!("voice_agent_turn_duration_ms").record(duration_ms as f64);
}

pub fn record_turn_error(reason: &str) {
    metrics::counter!("voice_agent_turn_errors_total", "reason" => reason.to_string()).increment(1);
}
