//! Shared application state: configuration, the session registry, the Turn
//! Pipeline, and the Turn Log, cloned cheaply (all fields are `Arc`) into
//! every handler.

use std::sync::Arc;
use std::time::Duration;

use voice_agent_config::Settings;
use voice_agent_persistence::TurnLog;
use voice_agent_pipeline::TurnPipeline;

use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub registry: Arc<SessionRegistry>,
    pub pipeline: Arc<TurnPipeline>,
    pub turn_log: Arc<dyn TurnLog>,
}

impl AppState {
    pub fn new(config: Settings, pipeline: Arc<TurnPipeline>, turn_log: Arc<dyn TurnLog>) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.server.max_sessions,
            Duration::from_secs(config.server.idle_timeout_seconds),
        ));
        registry.start_cleanup_task(Duration::from_secs(60));

        Self {
            config: Arc::new(config),
            registry,
            pipeline,
            turn_log,
        }
    }
}
