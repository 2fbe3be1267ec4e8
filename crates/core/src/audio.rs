//! Audio buffer types
//!
//! [`AudioBuffer`] is the wire-level container for audio as it arrives from a
//! client: raw bytes tagged with a source format and sample rate. [`PcmAudio`]
//! is the canonical decoded form used internally by the validator and the
//! collaborator adapters: mono, 16-bit signed little-endian PCM.

use serde::{Deserialize, Serialize};

/// Source encoding of an inbound audio buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Opus,
    Webm,
    Mp3,
}

/// Raw audio as received from a client: bytes plus the metadata needed to
/// decode them. Transient — owned by the Turn Pipeline for the lifetime of a
/// single turn and discarded afterward.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub bytes: Vec<u8>,
    pub format: AudioFormat,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(bytes: Vec<u8>, format: AudioFormat, sample_rate: u32) -> Self {
        Self {
            bytes,
            format,
            sample_rate,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }
}

/// Canonical form used once decoding settles: mono, 16-bit signed PCM,
/// little-endian, at a fixed sample rate (16 kHz inside the core).
#[derive(Debug, Clone)]
pub struct PcmAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmAudio {
    pub const CANONICAL_SAMPLE_RATE: u32 = 16_000;

    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode from little-endian PCM16 bytes, skipping a 44-byte WAV header
    /// if one is present (invariant I4: validator may run on raw PCM before
    /// a full WAV round-trip when the source format is already PCM-shaped).
    pub fn from_pcm16_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        let body = strip_wav_header(bytes);
        let samples: Vec<i16> = body
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Encode to a WAV file (mono, 16-bit PCM) using `hound`.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, hound::Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for &sample in &self.samples {
                writer.write_sample(sample)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }

    /// Decode a WAV file into canonical PCM, resampling to 16 kHz mono if the
    /// source differs.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self, hound::Error> {
        let cursor = std::io::Cursor::new(bytes);
        let mut reader = hound::WavReader::new(cursor)?;
        let spec = reader.spec();
        let samples: Vec<i16> = match spec.sample_format {
            hound::SampleFormat::Int => reader.samples::<i16>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
                .collect::<Result<_, _>>()?,
        };

        let mono = if spec.channels > 1 {
            downmix(&samples, spec.channels as usize)
        } else {
            samples
        };

        let pcm = Self::new(mono, spec.sample_rate);
        if spec.sample_rate != Self::CANONICAL_SAMPLE_RATE {
            Ok(pcm.resample(Self::CANONICAL_SAMPLE_RATE))
        } else {
            Ok(pcm)
        }
    }

    /// High-quality resampling via `rubato`, falling back to linear
    /// interpolation for very short buffers where FFT resampling would fail.
    pub fn resample(&self, target_rate: u32) -> Self {
        use rubato::{FftFixedIn, Resampler};

        if self.sample_rate == target_rate || self.samples.is_empty() {
            return Self::new(self.samples.clone(), target_rate);
        }

        if self.samples.len() < 64 {
            return self.resample_linear(target_rate);
        }

        let input_f64: Vec<f64> = self.samples.iter().map(|&s| s as f64 / 32768.0).collect();
        let chunk_size = input_f64.len().min(1024);

        match FftFixedIn::<f64>::new(self.sample_rate as usize, target_rate as usize, chunk_size, 2, 1)
        {
            Ok(mut resampler) => match resampler.process(&[input_f64], None) {
                Ok(output) => {
                    let samples = output[0]
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                        .collect();
                    Self::new(samples, target_rate)
                },
                Err(e) => {
                    tracing::warn!("rubato resample failed, using linear fallback: {}", e);
                    self.resample_linear(target_rate)
                },
            },
            Err(e) => {
                tracing::warn!("rubato init failed, using linear fallback: {}", e);
                self.resample_linear(target_rate)
            },
        }
    }

    fn resample_linear(&self, target_rate: u32) -> Self {
        let ratio = target_rate as f64 / self.sample_rate as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;
        let mut resampled = Vec::with_capacity(new_len);
        for i in 0..new_len {
            let src_idx = i as f64 / ratio;
            let idx_floor = src_idx.floor() as usize;
            let idx_ceil = (idx_floor + 1).min(self.samples.len().saturating_sub(1));
            let frac = src_idx - idx_floor as f64;
            let a = self.samples[idx_floor.min(self.samples.len().saturating_sub(1))] as f64;
            let b = self.samples[idx_ceil] as f64;
            resampled.push((a * (1.0 - frac) + b * frac) as i16);
        }
        Self::new(resampled, target_rate)
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

fn strip_wav_header(bytes: &[u8]) -> &[u8] {
    const WAV_HEADER_LEN: usize = 44;
    if bytes.len() > WAV_HEADER_LEN && &bytes[0..4] == b"RIFF" {
        &bytes[WAV_HEADER_LEN..]
    } else {
        bytes
    }
}

fn downmix(samples: &[i16], channels: usize) -> Vec<i16> {
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}
