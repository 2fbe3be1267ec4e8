//! Collaborator Adapters (C2): narrow, stateless-from-the-Session's-view
//! contracts to the three external services (ASR, agent, TTS) plus the
//! cache and persistence capabilities the Turn Pipeline needs on every turn.
//! One HTTP-backed reference implementation per collaborator is provided;
//! a different backend (local model, different vendor) is simply a
//! different implementation of the same trait.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};

use voice_agent_core::{AudioFormat, PcmAudio};

use crate::PipelineError;

/// Short-term conversational history passed to the agent so it can ground
/// its reply in the turn before. Opaque beyond that to the pipeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub history: Vec<ConversationTurn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_text: String,
    pub agent_text: String,
}

impl ConversationContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            history: Vec::new(),
        }
    }

    pub fn push(&mut self, user_text: impl Into<String>, agent_text: impl Into<String>) {
        self.history.push(ConversationTurn {
            user_text: user_text.into(),
            agent_text: agent_text.into(),
        });
        const MAX_HISTORY: usize = 10;
        if self.history.len() > MAX_HISTORY {
            let overflow = self.history.len() - MAX_HISTORY;
            self.history.drain(0..overflow);
        }
    }
}

/// ASR.Transcribe — accepts 16kHz mono s16le PCM WAV, returns text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, pcm: &PcmAudio) -> Result<String, PipelineError>;
}

/// Agent.Respond / Agent.RespondStream — text in, text out, opaque tool use.
#[async_trait]
pub trait ConversationAgent: Send + Sync {
    async fn respond(&self, user_text: &str, context: &ConversationContext) -> Result<String, PipelineError>;

    /// Streaming variant (spec §4.3 "Streaming mode"). The default forwards
    /// the full `respond()` result as a single fragment; an implementation
    /// backed by a token-streaming API overrides this for true streaming.
    fn respond_stream<'a>(
        &'a self,
        user_text: &'a str,
        context: &'a ConversationContext,
    ) -> Pin<Box<dyn Stream<Item = Result<String, PipelineError>> + Send + 'a>> {
        Box::pin(async_stream::stream! {
            yield self.respond(user_text, context).await;
        })
    }
}

/// TTS.Synthesize — text in, a finite lazy sequence of audio chunk bytes out.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn synthesize_stream<'a>(
        &'a self,
        text: &'a str,
        voice: &'a str,
        rate: f32,
    ) -> Pin<Box<dyn Stream<Item = Result<Vec<u8>, PipelineError>> + Send + 'a>>;
}

/// Cache.Get/Put — best-effort; failures never abort a turn.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, value: String, ttl: Duration);
}

/// Persistence.AppendTurn/GetSession, narrowed to the single operation the
/// pipeline performs directly; retrieval lives behind the Turn Log's own
/// read API (`voice_agent_persistence`), which implements this trait.
#[async_trait]
pub trait TurnPersistence: Send + Sync {
    async fn append_turn(&self, turn: &voice_agent_core::Turn) -> Result<(), PipelineError>;
}

/// Converts an inbound codec format + bytes into canonical PCM. Non-WAV
/// decoding (opus/webm/mp3) is itself an external-library concern (spec §1);
/// this is a narrow seam a real decoder plugs into. `WavPassthroughDecoder`
/// is the only format always available in-tree.
pub trait CodecDecoder: Send + Sync {
    /// Decodes to canonical 16kHz mono PCM (spec §6 "Audio canonical form").
    fn decode(&self, bytes: &[u8], format: AudioFormat) -> Result<PcmAudio, PipelineError>;
}

pub struct WavPassthroughDecoder;

impl CodecDecoder for WavPassthroughDecoder {
    fn decode(&self, bytes: &[u8], format: AudioFormat) -> Result<PcmAudio, PipelineError> {
        match format {
            AudioFormat::Wav => {
                PcmAudio::from_wav_bytes(bytes).map_err(|e| PipelineError::Codec(e.to_string()))
            },
            AudioFormat::Opus | AudioFormat::Webm | AudioFormat::Mp3 => {
                Err(PipelineError::Codec(format!("{:?} decoding requires a dedicated codec adapter", format)))
            },
        }
    }
}

// ---------------------------------------------------------------------
// HTTP reference implementations
// ---------------------------------------------------------------------

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    audio_base64: &'a str,
    sample_rate: u32,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
}

pub struct HttpTranscriber {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTranscriber {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builds with a plain timeout"),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, pcm: &PcmAudio) -> Result<String, PipelineError> {
        let wav = pcm
            .to_wav_bytes()
            .map_err(|e| PipelineError::Codec(e.to_string()))?;
        let audio_base64 = BASE64.encode(&wav);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&TranscribeRequest {
                audio_base64: &audio_base64,
                sample_rate: pcm.sample_rate,
            })
            .send()
            .await
            .map_err(|e| PipelineError::Asr(e.to_string()))?
            .error_for_status()
            .map_err(|e| PipelineError::Asr(e.to_string()))?
            .json::<TranscribeResponse>()
            .await
            .map_err(|e| PipelineError::Asr(e.to_string()))?;

        Ok(response.text)
    }
}

#[derive(Serialize)]
struct AgentRequest<'a> {
    text: &'a str,
    history: &'a [ConversationTurn],
}

#[derive(Deserialize)]
struct AgentResponse {
    text: String,
}

pub struct HttpAgent {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAgent {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builds with a plain timeout"),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ConversationAgent for HttpAgent {
    async fn respond(&self, user_text: &str, context: &ConversationContext) -> Result<String, PipelineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&AgentRequest {
                text: user_text,
                history: &context.history,
            })
            .send()
            .await
            .map_err(|e| PipelineError::Agent(e.to_string()))?
            .error_for_status()
            .map_err(|e| PipelineError::Agent(e.to_string()))?
            .json::<AgentResponse>()
            .await
            .map_err(|e| PipelineError::Agent(e.to_string()))?;

        Ok(response.text)
    }
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice: &'a str,
    rate: f32,
}

pub struct HttpSynthesizer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSynthesizer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client builds with a plain timeout"),
            endpoint: endpoint.into(),
        }
    }
}

/// Re-chunks an arbitrary byte stream into pieces no larger than
/// `max_chunk_bytes`, so one outbound `tts_chunk` targets the ~250-333ms of
/// audio spec §4.2 asks for regardless of how the collaborator chunked it.
const TTS_RECHUNK_BYTES: usize = 16_000;

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    fn synthesize_stream<'a>(
        &'a self,
        text: &'a str,
        voice: &'a str,
        rate: f32,
    ) -> Pin<Box<dyn Stream<Item = Result<Vec<u8>, PipelineError>> + Send + 'a>> {
        Box::pin(async_stream::stream! {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&SynthesizeRequest { text, voice, rate })
                .send()
                .await
                .map_err(|e| PipelineError::Tts(e.to_string()));

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    yield Err(e);
                    return;
                },
            };

            let bytes = match response.error_for_status() {
                Ok(r) => r.bytes().await,
                Err(e) => {
                    yield Err(PipelineError::Tts(e.to_string()));
                    return;
                },
            };

            let bytes = match bytes {
                Ok(b) => b,
                Err(e) => {
                    yield Err(PipelineError::Tts(e.to_string()));
                    return;
                },
            };

            for chunk in bytes.chunks(TTS_RECHUNK_BYTES) {
                yield Ok(chunk.to_vec());
            }
        })
    }
}

/// In-memory, `dashmap`-backed response cache with a per-entry TTL.
pub struct InMemoryResponseCache {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryResponseCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for InMemoryResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, key: &str) -> Option<String> {
        match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => Some(entry.0.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            },
            None => None,
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) {
        self.entries.insert(key.to_string(), (value, Instant::now() + ttl));
    }
}

/// Shared adapter bundle a `TurnPipeline` is constructed with.
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub agent: Arc<dyn ConversationAgent>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub cache: Arc<dyn ResponseCache>,
    pub persistence: Arc<dyn TurnPersistence>,
    pub codec: Arc<dyn CodecDecoder>,
}
