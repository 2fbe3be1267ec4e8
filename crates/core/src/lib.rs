//! Shared types for the voice conversation broker
//!
//! This crate provides the foundational data types used across the pipeline,
//! persistence, and server crates: audio buffers, the per-session state
//! machine and voice settings, the turn record, wire protocol frames, and the
//! shared error type. No I/O and no async runtime dependency lives here; it
//! is data plus the small amount of validation logic that belongs next to it.

pub mod audio;
pub mod error;
pub mod protocol;
pub mod session;
pub mod turn;

pub use audio::{AudioBuffer, AudioFormat, PcmAudio};
pub use error::{Error, Result};
pub use protocol::{ClientEvent, ServerEvent, TtsAudioFormat};
pub use session::{CompressionBitrate, CompressionCodec, SessionState, VoiceSettings};
pub use turn::Turn;
