//! Centralized constants for the voice conversation broker.
//!
//! A single source of truth for default values referenced by more than one
//! crate, so a threshold tuned here doesn't drift out of sync between the
//! validator, the pipeline, and the server's limits.

/// Collaborator endpoints (loaded from env vars with fallback defaults).
pub mod endpoints {
    use once_cell::sync::Lazy;

    /// ASR collaborator endpoint (env: ASR_ENDPOINT).
    pub static ASR_DEFAULT: Lazy<String> =
        Lazy::new(|| std::env::var("ASR_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:8001/transcribe".to_string()));

    /// Agent collaborator endpoint (env: AGENT_ENDPOINT).
    pub static AGENT_DEFAULT: Lazy<String> =
        Lazy::new(|| std::env::var("AGENT_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:8002/respond".to_string()));

    /// TTS collaborator endpoint (env: TTS_ENDPOINT).
    pub static TTS_DEFAULT: Lazy<String> =
        Lazy::new(|| std::env::var("TTS_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:8003/synthesize".to_string()));
}

/// Per-adapter and whole-turn timeouts (spec §5).
pub mod timeouts {
    pub const ASR_CALL_MS: u64 = 10_000;
    pub const AGENT_CALL_MS: u64 = 30_000;
    pub const TTS_CALL_MS: u64 = 30_000;
    pub const TURN_BUDGET_MS: u64 = 60_000;
}

/// Audio and VAD defaults (spec §3 `VoiceSettings`, §4.1 Audio Validator).
pub mod audio {
    pub const CANONICAL_SAMPLE_RATE: u32 = 16_000;
    pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8_000, 16_000, 32_000, 48_000];
    pub const VAD_FRAME_MS: u32 = 30;

    pub const ENERGY_THRESHOLD_DEFAULT: f64 = 500.0;
    pub const SPEECH_RATIO_THRESHOLD_DEFAULT: f64 = 0.03;
    pub const VAD_MODE_DEFAULT: u8 = 2;

    pub const TTS_CHUNK_TARGET_MS: u64 = 300;
}

/// Session and broker limits (spec §4.5, §6 "Configuration (enumerated)").
pub mod session {
    pub const MAX_SESSIONS_DEFAULT: usize = 200;
    pub const MAX_TURN_SECONDS_DEFAULT: u64 = 60;
    pub const IDLE_TIMEOUT_SECONDS_DEFAULT: u64 = 900;
    pub const OUTBOUND_CHANNEL_CAPACITY: usize = 64;
    pub const SLOW_CONSUMER_GRACE_MS: u64 = 200;
    pub const CONNECTED_RETRY_ATTEMPTS: u32 = 3;
    pub const CONNECTED_RETRY_BACKOFF_MS: u64 = 50;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vad_defaults_are_in_spec_range() {
        assert!((0.01..=0.5).contains(&audio::SPEECH_RATIO_THRESHOLD_DEFAULT));
        assert!(audio::VAD_MODE_DEFAULT <= 3);
    }

    #[test]
    fn timeouts_are_positive() {
        assert!(timeouts::ASR_CALL_MS > 0);
        assert!(timeouts::AGENT_CALL_MS > 0);
        assert!(timeouts::TTS_CALL_MS > 0);
        assert!(timeouts::TURN_BUDGET_MS >= timeouts::AGENT_CALL_MS);
    }

    #[test]
    fn supported_sample_rates_include_canonical() {
        assert!(audio::SUPPORTED_SAMPLE_RATES.contains(&audio::CANONICAL_SAMPLE_RATE));
    }
}
