//! Shared error type for `voice-agent-core`.

use thiserror::Error;

/// Errors that can arise from core data types: decoding audio, validating
/// settings, and (de)serializing protocol frames. Component-specific error
/// taxonomies (pipeline, persistence, server) live in their own crates and
/// wrap this one via `#[from]` where a core operation is in their call chain.
#[derive(Debug, Error)]
pub enum Error {
    #[error("audio decode failed: {0}")]
    AudioDecode(#[from] hound::Error),

    #[error("invalid setting {field}: {message}")]
    InvalidSetting { field: &'static str, message: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported sample rate {0}")]
    UnsupportedSampleRate(u32),
}

pub type Result<T> = std::result::Result<T, Error>;
