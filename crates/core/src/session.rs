//! Session state machine and per-session voice settings.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Per-connection lifecycle state (spec §4.4 state diagram).
///
/// ```text
/// Connecting --accept--> Idle
/// Idle --first audio--> Listening --buffer_closed--> Transcribing
/// Transcribing --text--> Generating --reply--> Speaking
/// Speaking --done--> Idle
/// Speaking --interrupt/new final--> Cancelling --ack--> Listening
/// Any --close--> Closed (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Idle,
    Listening,
    Transcribing,
    Generating,
    Speaking,
    Cancelling,
    Closed,
}

impl SessionState {
    /// True once a session has left the connection lifecycle entirely.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// True while the session holds at most one in-flight, non-sealed turn
    /// (invariant I1): these are the states a new final buffer may start a
    /// fresh turn from directly, without first cancelling one.
    pub fn accepts_new_turn(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Listening | SessionState::Speaking
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    Opus,
    Webm,
    Wav,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionBitrate {
    #[serde(rename = "32k")]
    B32k,
    #[serde(rename = "64k")]
    B64k,
    #[serde(rename = "128k")]
    B128k,
}

/// Per-session voice/VAD configuration (spec §3). Loaded at connect time from
/// defaults, cached on the `Session`, and mutable via a `settings_update`
/// event; every field is independently validated so a partial update can be
/// rejected field-by-field with a precise reason.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub vad_threshold: f64,
    pub silence_timeout_ms: u32,
    pub min_recording_ms: u32,
    pub backend_vad_enabled: bool,
    pub backend_vad_mode: u8,
    pub backend_energy_threshold: f64,
    pub backend_speech_ratio_threshold: f64,
    pub use_compression: bool,
    pub compression_codec: CompressionCodec,
    pub compression_bitrate: CompressionBitrate,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            vad_threshold: 0.05,
            silence_timeout_ms: 800,
            min_recording_ms: 500,
            backend_vad_enabled: true,
            backend_vad_mode: 2,
            backend_energy_threshold: 500.0,
            backend_speech_ratio_threshold: 0.03,
            use_compression: false,
            compression_codec: CompressionCodec::Wav,
            compression_bitrate: CompressionBitrate::B64k,
        }
    }
}

impl VoiceSettings {
    /// Validates every field against the ranges spec'd in §3. Returns the
    /// first violation found; callers applying a partial update should
    /// validate the merged result, not just the changed fields, so that a
    /// field made invalid by interaction with another is still caught.
    pub fn validate(&self) -> Result<()> {
        if !(0.01..=0.1).contains(&self.vad_threshold) {
            return Err(Error::InvalidSetting {
                field: "vad_threshold",
                message: format!("{} outside [0.01, 0.1]", self.vad_threshold),
            });
        }
        if !(300..=2000).contains(&self.silence_timeout_ms) {
            return Err(Error::InvalidSetting {
                field: "silence_timeout_ms",
                message: format!("{} outside [300, 2000]", self.silence_timeout_ms),
            });
        }
        if !(300..=2000).contains(&self.min_recording_ms) {
            return Err(Error::InvalidSetting {
                field: "min_recording_ms",
                message: format!("{} outside [300, 2000]", self.min_recording_ms),
            });
        }
        if self.backend_vad_mode > 3 {
            return Err(Error::InvalidSetting {
                field: "backend_vad_mode",
                message: format!("{} outside {{0,1,2,3}}", self.backend_vad_mode),
            });
        }
        if self.backend_energy_threshold < 0.0 {
            return Err(Error::InvalidSetting {
                field: "backend_energy_threshold",
                message: "must be non-negative".to_string(),
            });
        }
        if !(0.01..=0.5).contains(&self.backend_speech_ratio_threshold) {
            return Err(Error::InvalidSetting {
                field: "backend_speech_ratio_threshold",
                message: format!("{} outside [0.01, 0.5]", self.backend_speech_ratio_threshold),
            });
        }
        Ok(())
    }

    /// Merges a partial JSON update (the `settings_update` event's `data`
    /// object) over `self`, then validates the result.
    pub fn merged_with(&self, update: &serde_json::Value) -> Result<Self> {
        let mut base = serde_json::to_value(self)?;
        if let (Some(base_obj), Some(update_obj)) = (base.as_object_mut(), update.as_object()) {
            for (key, value) in update_obj {
                base_obj.insert(key.clone(), value.clone());
            }
        }
        let merged: Self = serde_json::from_value(base)?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(VoiceSettings::default().validate().is_ok());
    }

    #[test]
    fn rejects_vad_threshold_out_of_range() {
        let mut settings = VoiceSettings::default();
        settings.vad_threshold = 0.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn merge_applies_partial_update_and_validates() {
        let settings = VoiceSettings::default();
        let update = serde_json::json!({ "silence_timeout_ms": 1200 });
        let merged = settings.merged_with(&update).unwrap();
        assert_eq!(merged.silence_timeout_ms, 1200);
        assert_eq!(merged.vad_threshold, settings.vad_threshold);
    }

    #[test]
    fn merge_rejects_invalid_partial_update() {
        let settings = VoiceSettings::default();
        let update = serde_json::json!({ "backend_vad_mode": 9 });
        assert!(settings.merged_with(&update).is_err());
    }

    #[test]
    fn accepts_new_turn_matches_spec_states() {
        assert!(SessionState::Idle.accepts_new_turn());
        assert!(SessionState::Listening.accepts_new_turn());
        assert!(SessionState::Speaking.accepts_new_turn());
        assert!(!SessionState::Transcribing.accepts_new_turn());
        assert!(!SessionState::Generating.accepts_new_turn());
    }
}
