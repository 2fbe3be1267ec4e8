//! Stage 2: frame-level speech/non-speech classification using a
//! WebRTC-style VAD, as spec'd in §4.1. Frames shorter than a full 30ms are
//! discarded for ratio purposes, per spec.

use webrtc_vad::{SampleRate, Vad, VadMode};

pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8_000, 16_000, 32_000, 48_000];
const FRAME_MS: u32 = 30;

#[derive(Debug)]
pub struct FrameVadError;

fn sample_rate_of(rate: u32) -> Result<SampleRate, FrameVadError> {
    match rate {
        8_000 => Ok(SampleRate::Rate8kHz),
        16_000 => Ok(SampleRate::Rate16kHz),
        32_000 => Ok(SampleRate::Rate32kHz),
        48_000 => Ok(SampleRate::Rate48kHz),
        _ => Err(FrameVadError),
    }
}

fn mode_of(mode: u8) -> VadMode {
    match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

/// Slices `samples` into 30ms frames at `sample_rate` and classifies each one
/// as speech or non-speech, returning `speech_frames / total_frames`.
pub fn speech_ratio(samples: &[i16], sample_rate: u32, mode: u8) -> Result<f64, FrameVadError> {
    let rate = sample_rate_of(sample_rate)?;
    let mut vad = Vad::new_with_rate_and_mode(rate, mode_of(mode));

    let frame_len = (sample_rate as usize * FRAME_MS as usize) / 1000;
    if frame_len == 0 {
        return Err(FrameVadError);
    }

    let mut total_frames = 0u32;
    let mut speech_frames = 0u32;

    for frame in samples.chunks(frame_len) {
        if frame.len() < frame_len {
            break;
        }
        total_frames += 1;
        if vad.is_voice_segment(frame).unwrap_or(false) {
            speech_frames += 1;
        }
    }

    if total_frames == 0 {
        return Ok(0.0);
    }

    Ok(speech_frames as f64 / total_frames as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_rate() {
        assert!(sample_rate_of(11025).is_err());
    }

    #[test]
    fn zero_full_frames_yields_zero_ratio_not_error() {
        let samples = vec![0i16; 10];
        let ratio = speech_ratio(&samples, 16000, 2).unwrap();
        assert_eq!(ratio, 0.0);
    }

    #[test]
    fn silence_has_low_speech_ratio() {
        let samples = vec![0i16; 16000];
        let ratio = speech_ratio(&samples, 16000, 2).unwrap();
        assert!(ratio < 0.5);
    }
}
