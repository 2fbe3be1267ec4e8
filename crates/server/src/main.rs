//! Voice Agent Server entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use voice_agent_config::{load_settings, Settings};
use voice_agent_persistence::FileTurnLog;
use voice_agent_pipeline::{
    Collaborators, HttpAgent, HttpSynthesizer, HttpTranscriber, InMemoryResponseCache, PipelineTimeouts,
    TurnPersistence, TurnPipeline, WavPassthroughDecoder,
};
use voice_agent_server::{create_router, init_metrics, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env = std::env::var("VOICE_AGENT_ENV").ok();
    let config = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Warning: failed to load config: {e}. Using defaults.");
            Settings::default()
        },
    };

    init_tracing(&config);
    let _metrics_handle = init_metrics();
    tracing::info!("initialized Prometheus metrics at /metrics");

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.environment,
        config_env = env.as_deref().unwrap_or("default"),
        "starting voice agent server"
    );

    let turn_log = Arc::new(FileTurnLog::new(config.log_dir.clone()));
    let pipeline = Arc::new(TurnPipeline::new(
        Arc::new(build_collaborators(&config, turn_log.clone())),
        PipelineTimeouts {
            asr: Duration::from_millis(config.collaborators.asr_timeout_ms),
            agent: Duration::from_millis(config.collaborators.agent_timeout_ms),
            tts: Duration::from_millis(config.collaborators.tts_timeout_ms),
            turn_budget: Duration::from_secs(config.server.max_turn_seconds),
        },
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let state = AppState::new(config, pipeline, turn_log);
    let app = create_router(state);

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

/// The Turn Pipeline's `persistence` seam is satisfied by the same
/// `FileTurnLog` the HTTP surface reads from (spec §4.2, §4.6): one store,
/// two narrow views onto it.
fn build_collaborators(config: &Settings, turn_log: Arc<FileTurnLog>) -> Collaborators {
    Collaborators {
        transcriber: Arc::new(HttpTranscriber::new(
            config.collaborators.asr_endpoint.clone(),
            Duration::from_millis(config.collaborators.asr_timeout_ms),
        )),
        agent: Arc::new(HttpAgent::new(
            config.collaborators.agent_endpoint.clone(),
            Duration::from_millis(config.collaborators.agent_timeout_ms),
        )),
        synthesizer: Arc::new(HttpSynthesizer::new(
            config.collaborators.tts_endpoint.clone(),
            Duration::from_millis(config.collaborators.tts_timeout_ms),
        )),
        cache: Arc::new(InMemoryResponseCache::new()),
        persistence: turn_log as Arc<dyn TurnPersistence>,
        codec: Arc::new(WavPassthroughDecoder),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("voice_agent={},tower_http=info", config.observability.log_level).into());

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
