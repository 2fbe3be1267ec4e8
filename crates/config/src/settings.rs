//! Main settings module: layered file + environment configuration for the
//! broker (spec §6 "Configuration (enumerated)").

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::{audio, endpoints, session, timeouts};
use crate::ConfigError;

/// Runtime environment: gates how strictly settings are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl RuntimeEnvironment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

/// Top-level settings, loaded once at startup and held behind a
/// `parking_lot::RwLock` by `AppState` so a future admin-reload path can
/// swap it without restarting the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub environment: RuntimeEnvironment,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub vad: VadDefaults,

    #[serde(default)]
    pub collaborators: CollaboratorConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            environment: RuntimeEnvironment::default(),
            server: ServerConfig::default(),
            vad: VadDefaults::default(),
            collaborators: CollaboratorConfig::default(),
            observability: ObservabilityConfig::default(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> String {
    "data/turns".to_string()
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_server()?;
        self.validate_vad()?;
        self.validate_collaborators()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        let server = &self.server;

        if server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port".to_string(),
                message: "Port cannot be 0".to_string(),
            });
        }

        if server.max_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.max_sessions".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if server.max_turn_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.max_turn_seconds".to_string(),
                message: "Must be at least 1".to_string(),
            });
        }

        if self.environment.is_production() && server.origin_allowlist.is_empty() {
            tracing::warn!(
                "origin_allowlist is empty in production; all WebSocket upgrades will be rejected"
            );
        }

        Ok(())
    }

    fn validate_vad(&self) -> Result<(), ConfigError> {
        let vad = &self.vad;

        if !(0.01..=0.5).contains(&vad.speech_ratio_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "vad.speech_ratio_threshold".to_string(),
                message: format!("{} outside [0.01, 0.5]", vad.speech_ratio_threshold),
            });
        }

        if vad.mode > 3 {
            return Err(ConfigError::InvalidValue {
                field: "vad.mode".to_string(),
                message: format!("{} outside {{0,1,2,3}}", vad.mode),
            });
        }

        if vad.energy_threshold < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "vad.energy_threshold".to_string(),
                message: "must be non-negative".to_string(),
            });
        }

        Ok(())
    }

    fn validate_collaborators(&self) -> Result<(), ConfigError> {
        if self.collaborators.asr_endpoint.is_empty() {
            return Err(ConfigError::MissingField("collaborators.asr_endpoint".to_string()));
        }
        if self.collaborators.agent_endpoint.is_empty() {
            return Err(ConfigError::MissingField("collaborators.agent_endpoint".to_string()));
        }
        if self.collaborators.tts_endpoint.is_empty() {
            return Err(ConfigError::MissingField("collaborators.tts_endpoint".to_string()));
        }
        Ok(())
    }
}

/// WebSocket/HTTP server and broker limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_max_turn_seconds")]
    pub max_turn_seconds: u64,

    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,

    #[serde(default)]
    pub origin_allowlist: Vec<String>,

    #[serde(default = "default_outbound_channel_capacity")]
    pub outbound_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            max_sessions: default_max_sessions(),
            max_turn_seconds: default_max_turn_seconds(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            origin_allowlist: Vec::new(),
            outbound_channel_capacity: default_outbound_channel_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_max_sessions() -> usize {
    session::MAX_SESSIONS_DEFAULT
}
fn default_max_turn_seconds() -> u64 {
    session::MAX_TURN_SECONDS_DEFAULT
}
fn default_idle_timeout_seconds() -> u64 {
    session::IDLE_TIMEOUT_SECONDS_DEFAULT
}
fn default_outbound_channel_capacity() -> usize {
    session::OUTBOUND_CHANNEL_CAPACITY
}

/// Process-wide defaults for `voice_agent_core::VoiceSettings`; a session may
/// override any of these via a `settings_update` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadDefaults {
    #[serde(default = "default_energy_threshold")]
    pub energy_threshold: f64,

    #[serde(default = "default_speech_ratio_threshold")]
    pub speech_ratio_threshold: f64,

    #[serde(default = "default_vad_mode")]
    pub mode: u8,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for VadDefaults {
    fn default() -> Self {
        Self {
            energy_threshold: default_energy_threshold(),
            speech_ratio_threshold: default_speech_ratio_threshold(),
            mode: default_vad_mode(),
            enabled: true,
        }
    }
}

fn default_energy_threshold() -> f64 {
    audio::ENERGY_THRESHOLD_DEFAULT
}
fn default_speech_ratio_threshold() -> f64 {
    audio::SPEECH_RATIO_THRESHOLD_DEFAULT
}
fn default_vad_mode() -> u8 {
    audio::VAD_MODE_DEFAULT
}
fn default_true() -> bool {
    true
}

/// Endpoints and timeouts for the three external collaborators (spec §1, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    #[serde(default = "default_asr_endpoint")]
    pub asr_endpoint: String,

    #[serde(default = "default_agent_endpoint")]
    pub agent_endpoint: String,

    #[serde(default = "default_tts_endpoint")]
    pub tts_endpoint: String,

    #[serde(default = "default_tts_voice")]
    pub tts_voice_default: String,

    #[serde(default = "default_tts_rate")]
    pub tts_rate_default: f32,

    #[serde(default = "default_asr_timeout_ms")]
    pub asr_timeout_ms: u64,

    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,

    #[serde(default = "default_tts_timeout_ms")]
    pub tts_timeout_ms: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            asr_endpoint: default_asr_endpoint(),
            agent_endpoint: default_agent_endpoint(),
            tts_endpoint: default_tts_endpoint(),
            tts_voice_default: default_tts_voice(),
            tts_rate_default: default_tts_rate(),
            asr_timeout_ms: default_asr_timeout_ms(),
            agent_timeout_ms: default_agent_timeout_ms(),
            tts_timeout_ms: default_tts_timeout_ms(),
        }
    }
}

fn default_asr_endpoint() -> String {
    endpoints::ASR_DEFAULT.clone()
}
fn default_agent_endpoint() -> String {
    endpoints::AGENT_DEFAULT.clone()
}
fn default_tts_endpoint() -> String {
    endpoints::TTS_DEFAULT.clone()
}
fn default_tts_voice() -> String {
    "default".to_string()
}
fn default_tts_rate() -> f32 {
    1.0
}
fn default_asr_timeout_ms() -> u64 {
    timeouts::ASR_CALL_MS
}
fn default_agent_timeout_ms() -> u64 {
    timeouts::AGENT_CALL_MS
}
fn default_tts_timeout_ms() -> u64 {
    timeouts::TTS_CALL_MS
}

/// Logging/tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            otlp_endpoint: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Loads settings from files and environment.
///
/// Priority (highest to lowest): environment variables (`VOICE_AGENT_`
/// prefix) > `config/{env}.yaml` > `config/default.yaml` > struct defaults.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    builder = builder.add_source(File::with_name("config/default").required(false));

    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("config/{}", env_name)).required(false));
    }

    builder = builder.add_source(
        Environment::with_prefix("VOICE_AGENT")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}
