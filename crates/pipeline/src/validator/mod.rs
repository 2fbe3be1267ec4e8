//! Audio Validator (C1): a two-stage, pure, thread-safe gate deciding
//! whether a buffer of PCM audio is worth transcribing.

mod energy;
mod frame_vad;

use serde::{Deserialize, Serialize};

/// Inputs that govern both stages; sourced from a session's
/// `voice_agent_core::VoiceSettings` at call time, so a `settings_update`
/// takes effect on the very next validation (no stale reads).
#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    pub energy_threshold: f64,
    pub vad_enabled: bool,
    pub vad_mode: u8,
    pub speech_ratio_threshold: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 500.0,
            vad_enabled: true,
            vad_mode: 2,
            speech_ratio_threshold: 0.03,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub energy_rms: f64,
    pub speech_ratio: f64,
    pub reason: Option<String>,
}

impl ValidationMetrics {
    fn accepted(energy_rms: f64, speech_ratio: f64) -> Self {
        Self {
            energy_rms,
            speech_ratio,
            reason: None,
        }
    }

    fn rejected(energy_rms: f64, speech_ratio: f64, reason: &str) -> Self {
        Self {
            energy_rms,
            speech_ratio,
            reason: Some(reason.to_string()),
        }
    }
}

/// Runs both stages of the validator over little-endian signed 16-bit PCM.
/// Never panics on well-formed input; malformed input (odd byte count after
/// header-stripping, empty buffer) returns `(false, {reason: "decode_error"})`
/// rather than propagating an error, matching spec §4.1's failure contract.
pub fn validate(pcm_bytes_le_s16: &[u8], sample_rate: u32, cfg: &ValidatorConfig) -> (bool, ValidationMetrics) {
    let samples = match energy::decode_samples(pcm_bytes_le_s16) {
        Some(samples) if !samples.is_empty() => samples,
        _ => return (false, ValidationMetrics::rejected(0.0, 0.0, "decode_error")),
    };

    let energy_rms = energy::rms(&samples);
    if energy_rms < cfg.energy_threshold {
        return (false, ValidationMetrics::rejected(energy_rms, 0.0, "insufficient_energy"));
    }

    if !cfg.vad_enabled {
        return (true, ValidationMetrics::accepted(energy_rms, 1.0));
    }

    if !frame_vad::SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
        return (false, ValidationMetrics::rejected(energy_rms, 0.0, "unsupported_sample_rate"));
    }

    match frame_vad::speech_ratio(&samples, sample_rate, cfg.vad_mode) {
        Ok(speech_ratio) => {
            if speech_ratio >= cfg.speech_ratio_threshold {
                (true, ValidationMetrics::accepted(energy_rms, speech_ratio))
            } else {
                (false, ValidationMetrics::rejected(energy_rms, speech_ratio, "insufficient_speech_ratio"))
            }
        },
        Err(_) => (false, ValidationMetrics::rejected(energy_rms, 0.0, "decode_error")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silence(num_samples: usize) -> Vec<u8> {
        vec![0u8; num_samples * 2]
    }

    fn tone(num_samples: usize, amplitude: i16) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(num_samples * 2);
        for i in 0..num_samples {
            let phase = (i as f64 * 0.1).sin();
            let sample = (phase * amplitude as f64) as i16;
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn silence_is_rejected_for_insufficient_energy() {
        let cfg = ValidatorConfig::default();
        let (accepted, metrics) = validate(&silence(16000), 16000, &cfg);
        assert!(!accepted);
        assert_eq!(metrics.reason.as_deref(), Some("insufficient_energy"));
    }

    #[test]
    fn energy_exactly_at_threshold_is_accepted() {
        let mut cfg = ValidatorConfig::default();
        cfg.vad_enabled = false;
        let samples: Vec<i16> = vec![cfg.energy_threshold as i16; 100];
        let mut bytes = Vec::with_capacity(200);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let (accepted, metrics) = validate(&bytes, 16000, &cfg);
        assert!(accepted);
        assert!(metrics.energy_rms >= cfg.energy_threshold);
    }

    #[test]
    fn loud_tone_passes_energy_gate() {
        let cfg = ValidatorConfig::default();
        let (_, metrics) = validate(&tone(16000, 8000), 16000, &cfg);
        assert!(metrics.energy_rms >= cfg.energy_threshold);
    }

    #[test]
    fn unsupported_sample_rate_is_rejected() {
        let cfg = ValidatorConfig::default();
        let (accepted, metrics) = validate(&tone(16000, 8000), 11025, &cfg);
        assert!(!accepted);
        assert_eq!(metrics.reason.as_deref(), Some("unsupported_sample_rate"));
    }

    #[test]
    fn empty_buffer_yields_decode_error_not_panic() {
        let cfg = ValidatorConfig::default();
        let (accepted, metrics) = validate(&[], 16000, &cfg);
        assert!(!accepted);
        assert_eq!(metrics.reason.as_deref(), Some("decode_error"));
    }

    #[test]
    fn vad_disabled_skips_stage_two() {
        let mut cfg = ValidatorConfig::default();
        cfg.vad_enabled = false;
        let (accepted, metrics) = validate(&tone(16000, 8000), 16000, &cfg);
        assert!(accepted);
        assert_eq!(metrics.speech_ratio, 1.0);
    }
}
