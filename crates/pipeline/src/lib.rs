//! Audio Validator, Collaborator Adapters, and the Turn Pipeline: the three
//! leaf-to-middle components of the voice conversation broker (C1-C3).

pub mod adapters;
pub mod orchestrator;
pub mod validator;

pub use adapters::{
    Collaborators, CodecDecoder, ConversationAgent, ConversationContext, ConversationTurn,
    HttpAgent, HttpSynthesizer, HttpTranscriber, InMemoryResponseCache, ResponseCache,
    Synthesizer, Transcriber, TurnPersistence, WavPassthroughDecoder,
};
pub use orchestrator::{PipelineEvent, PipelineTimeouts, TurnPipeline};
pub use validator::{validate, ValidationMetrics, ValidatorConfig};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("ASR call failed: {0}")]
    Asr(String),

    #[error("agent call failed: {0}")]
    Agent(String),

    #[error("TTS call failed: {0}")]
    Tts(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("persistence call failed: {0}")]
    Persistence(String),

    #[error("adapter call timed out after {0:?} at stage {1}")]
    Timeout(std::time::Duration, &'static str),

    #[error(transparent)]
    Core(#[from] voice_agent_core::Error),
}
