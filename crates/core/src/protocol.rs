//! WebSocket wire protocol: every frame exchanged with a client is a single
//! JSON text object `{ "event": <string>, "data": <object> }` (spec §6).
//! Binary frames are rejected at the transport boundary, not modeled here.

use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;

/// Frames a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    AudioChunk {
        audio_chunk: String,
        format: AudioFormat,
        sample_rate: u32,
        is_final: bool,
        #[serde(default)]
        compression: Option<serde_json::Value>,
    },
    Interrupt {
        #[serde(default)]
        reason: Option<String>,
    },
    SettingsUpdate {
        #[serde(flatten)]
        fields: serde_json::Value,
    },
    Ping {
        ts: i64,
    },
}

/// Audio format accepted in an outbound `tts_chunk` (mp3 or opus only, per
/// spec §6 — a narrower set than the inbound `AudioFormat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsAudioFormat {
    Mp3,
    Opus,
}

/// Frames the server may send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        session_id: String,
        timestamp: i64,
    },
    Transcription {
        text: String,
        timestamp: i64,
    },
    AgentResponse {
        text: String,
        timestamp: i64,
    },
    TtsChunk {
        audio_chunk: String,
        chunk_index: u32,
        format: TtsAudioFormat,
        timestamp: i64,
    },
    StreamingComplete {
        chunks_sent: u32,
        duration_ms: u64,
    },
    StreamingInterrupted {
        chunks_sent: u32,
    },
    ValidationRejected {
        reason: String,
        energy: f64,
        speech_ratio: f64,
    },
    Error {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    SettingsAck {
        settings: crate::session::VoiceSettings,
    },
    Pong {
        ts: i64,
    },
}

impl ServerEvent {
    pub fn error(reason: impl Into<String>) -> Self {
        ServerEvent::Error {
            reason: reason.into(),
            stage: None,
            detail: None,
        }
    }

    pub fn error_at_stage(reason: impl Into<String>, stage: impl Into<String>) -> Self {
        ServerEvent::Error {
            reason: reason.into(),
            stage: Some(stage.into()),
            detail: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
