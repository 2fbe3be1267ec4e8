//! End-to-end Turn Pipeline scenarios driven against stub collaborators,
//! exercising the event sequences a session/broker layer would forward to a
//! client as a turn runs to completion, interruption, or failure.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voice_agent_core::{AudioBuffer, AudioFormat, PcmAudio, Turn, VoiceSettings};
use voice_agent_pipeline::{
    Collaborators, ConversationContext, ConversationAgent, InMemoryResponseCache, PipelineError,
    PipelineEvent, PipelineTimeouts, ResponseCache, Synthesizer, TurnPersistence, TurnPipeline,
    Transcriber, WavPassthroughDecoder,
};

/// A loud, low-frequency tone that reliably clears the energy gate; VAD is
/// disabled on the settings these tests use so only stage 1 decides
/// acceptance, keeping the scenarios deterministic without depending on
/// `webrtc-vad`'s classification of synthetic audio.
fn loud_wav(num_samples: usize) -> Vec<u8> {
    let samples: Vec<i16> = (0..num_samples).map(|i| (((i as f64) * 0.1).sin() * 8000.0) as i16).collect();
    PcmAudio::new(samples, 16000).to_wav_bytes().unwrap()
}

fn silent_wav(num_samples: usize) -> Vec<u8> {
    PcmAudio::new(vec![0i16; num_samples], 16000).to_wav_bytes().unwrap()
}

fn settings_vad_disabled() -> VoiceSettings {
    let mut s = VoiceSettings::default();
    s.backend_vad_enabled = false;
    s
}

struct StubTranscriber {
    reply: String,
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(&self, _pcm: &PcmAudio) -> Result<String, PipelineError> {
        Ok(self.reply.clone())
    }
}

struct StubAgent {
    reply: String,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ConversationAgent for StubAgent {
    async fn respond(&self, _user_text: &str, _context: &ConversationContext) -> Result<String, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.reply.clone())
    }
}

struct StubSynthesizer;

#[async_trait]
impl Synthesizer for StubSynthesizer {
    fn synthesize_stream<'a>(
        &'a self,
        text: &'a str,
        _voice: &'a str,
        _rate: f32,
    ) -> Pin<Box<dyn Stream<Item = Result<Vec<u8>, PipelineError>> + Send + 'a>> {
        let bytes = text.as_bytes().to_vec();
        Box::pin(async_stream::stream! {
            yield Ok(bytes);
        })
    }
}

/// Yields chunks slowly so a test can cancel mid-stream and assert the
/// in-flight sentence stops within one chunk rather than draining to the end.
struct SlowSynthesizer {
    chunk_delay: Duration,
    chunks_per_sentence: usize,
}

#[async_trait]
impl Synthesizer for SlowSynthesizer {
    fn synthesize_stream<'a>(
        &'a self,
        _text: &'a str,
        _voice: &'a str,
        _rate: f32,
    ) -> Pin<Box<dyn Stream<Item = Result<Vec<u8>, PipelineError>> + Send + 'a>> {
        let delay = self.chunk_delay;
        let count = self.chunks_per_sentence;
        Box::pin(async_stream::stream! {
            for _ in 0..count {
                tokio::time::sleep(delay).await;
                yield Ok(vec![0u8; 4]);
            }
        })
    }
}

struct NullCache;

#[async_trait]
impl ResponseCache for NullCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }
    async fn put(&self, _key: &str, _value: String, _ttl: Duration) {}
}

#[derive(Default)]
struct RecordingPersistence {
    turns: Mutex<Vec<Turn>>,
}

#[async_trait]
impl TurnPersistence for RecordingPersistence {
    async fn append_turn(&self, turn: &Turn) -> Result<(), PipelineError> {
        self.turns.lock().push(turn.clone());
        Ok(())
    }
}

struct FailingTranscriber;

#[async_trait]
impl Transcriber for FailingTranscriber {
    async fn transcribe(&self, _pcm: &PcmAudio) -> Result<String, PipelineError> {
        Ok(String::new())
    }
}

struct NeverRespondingAgent;

#[async_trait]
impl ConversationAgent for NeverRespondingAgent {
    async fn respond(&self, _user_text: &str, _context: &ConversationContext) -> Result<String, PipelineError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(String::new())
    }
}

fn pipeline_with(
    transcriber: Arc<dyn Transcriber>,
    agent: Arc<dyn ConversationAgent>,
    timeouts: PipelineTimeouts,
) -> (TurnPipeline, Arc<RecordingPersistence>) {
    let persistence = Arc::new(RecordingPersistence::default());
    let collaborators = Collaborators {
        transcriber,
        agent,
        synthesizer: Arc::new(StubSynthesizer),
        cache: Arc::new(NullCache),
        persistence: persistence.clone() as Arc<dyn TurnPersistence>,
        codec: Arc::new(WavPassthroughDecoder),
    };
    (TurnPipeline::new(Arc::new(collaborators), timeouts), persistence)
}

async fn drain(mut rx: mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn happy_path_emits_transcription_then_reply_then_contiguous_chunks_then_complete() {
    let (pipeline, persistence) = pipeline_with(
        Arc::new(StubTranscriber { reply: "what is the weather".to_string() }),
        Arc::new(StubAgent { reply: "It is sunny. Bring sunglasses.".to_string(), delay: None, calls: Arc::new(AtomicUsize::new(0)) }),
        PipelineTimeouts::default(),
    );

    let audio = AudioBuffer::new(loud_wav(16000), AudioFormat::Wav, 16000);
    let settings = settings_vad_disabled();
    let mut context = ConversationContext::new("session-1");
    let (tx, rx) = mpsc::channel(32);

    let turn = pipeline
        .run_turn("session-1", audio, &settings, &mut context, CancellationToken::new(), tx, "default", 1.0)
        .await;

    let events = drain(rx).await;

    assert!(matches!(events[0], PipelineEvent::Transcription { .. }));
    assert!(matches!(events[1], PipelineEvent::AgentResponse { .. }));
    let chunk_indices: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::TtsChunk { chunk_index, .. } => Some(*chunk_index),
            _ => None,
        })
        .collect();
    assert!(!chunk_indices.is_empty());
    for (i, idx) in chunk_indices.iter().enumerate() {
        assert_eq!(*idx, i as u32, "chunk_index must be contiguous from zero");
    }
    assert!(matches!(events.last().unwrap(), PipelineEvent::StreamingComplete { .. }));
    assert!(!events.iter().any(|e| matches!(e, PipelineEvent::StreamingInterrupted { .. })));

    assert!(turn.is_sealed());
    assert!(!turn.interrupted);
    assert_eq!(turn.transcription, "what is the weather");
    assert_eq!(persistence.turns.lock().len(), 1);
    assert_eq!(context.history.len(), 1);
}

#[tokio::test]
async fn cancelling_mid_generation_yields_exactly_one_interrupted_and_no_complete() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (pipeline, _persistence) = pipeline_with(
        Arc::new(StubTranscriber { reply: "hello".to_string() }),
        Arc::new(StubAgent { reply: "a long reply".to_string(), delay: Some(Duration::from_millis(200)), calls: calls.clone() }),
        PipelineTimeouts::default(),
    );

    let audio = AudioBuffer::new(loud_wav(16000), AudioFormat::Wav, 16000);
    let settings = settings_vad_disabled();
    let mut context = ConversationContext::new("session-1");
    let (tx, rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_clone.cancel();
    });

    let turn = pipeline
        .run_turn("session-1", audio, &settings, &mut context, cancel, tx, "default", 1.0)
        .await;

    let events = drain(rx).await;
    let interrupted_count = events.iter().filter(|e| matches!(e, PipelineEvent::StreamingInterrupted { .. })).count();
    assert_eq!(interrupted_count, 1);
    assert!(!events.iter().any(|e| matches!(e, PipelineEvent::StreamingComplete { .. })));
    assert!(turn.interrupted);
}

#[tokio::test]
async fn cancelling_mid_sentence_stops_synthesis_within_one_chunk() {
    let persistence = Arc::new(RecordingPersistence::default());
    let collaborators = Collaborators {
        transcriber: Arc::new(StubTranscriber { reply: "hello".to_string() }),
        agent: Arc::new(StubAgent {
            reply: "This is a single long sentence with many words in it.".to_string(),
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }),
        synthesizer: Arc::new(SlowSynthesizer { chunk_delay: Duration::from_millis(50), chunks_per_sentence: 20 }),
        cache: Arc::new(NullCache),
        persistence: persistence.clone() as Arc<dyn TurnPersistence>,
        codec: Arc::new(WavPassthroughDecoder),
    };
    let pipeline = TurnPipeline::new(Arc::new(collaborators), PipelineTimeouts::default());

    let audio = AudioBuffer::new(loud_wav(16000), AudioFormat::Wav, 16000);
    let settings = settings_vad_disabled();
    let mut context = ConversationContext::new("session-1");
    let (tx, rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        // Let exactly one chunk land, then cancel mid-sentence.
        tokio::time::sleep(Duration::from_millis(80)).await;
        cancel_clone.cancel();
    });

    let start = tokio::time::Instant::now();
    let turn = pipeline
        .run_turn("session-1", audio, &settings, &mut context, cancel, tx, "default", 1.0)
        .await;
    let elapsed = start.elapsed();

    let events = drain(rx).await;
    let chunk_count = events.iter().filter(|e| matches!(e, PipelineEvent::TtsChunk { .. })).count();

    assert!(turn.interrupted);
    assert!(chunk_count < 20, "cancellation should stop well short of all 20 chunks, got {chunk_count}");
    // 20 chunks at 50ms each would take ~1s; bounded cancellation should
    // finish in well under that even though the stream itself never closes.
    assert!(elapsed < Duration::from_millis(600), "cancellation took too long: {elapsed:?}");
}

#[tokio::test]
async fn silence_is_rejected_before_any_transcription_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    struct CountingTranscriber(Arc<AtomicUsize>);
    #[async_trait]
    impl Transcriber for CountingTranscriber {
        async fn transcribe(&self, _pcm: &PcmAudio) -> Result<String, PipelineError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok("should not be reached".to_string())
        }
    }

    let (pipeline, _persistence) = pipeline_with(
        Arc::new(CountingTranscriber(calls.clone())),
        Arc::new(StubAgent { reply: String::new(), delay: None, calls: Arc::new(AtomicUsize::new(0)) }),
        PipelineTimeouts::default(),
    );

    let audio = AudioBuffer::new(silent_wav(16000), AudioFormat::Wav, 16000);
    let settings = VoiceSettings::default();
    let mut context = ConversationContext::new("session-1");
    let (tx, rx) = mpsc::channel(32);

    let turn = pipeline
        .run_turn("session-1", audio, &settings, &mut context, CancellationToken::new(), tx, "default", 1.0)
        .await;

    let events = drain(rx).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(matches!(events[0], PipelineEvent::ValidationRejected { ref reason, .. } if reason == "insufficient_energy"));
    assert!(turn.is_sealed());
    assert!(turn.transcription.is_empty());
}

#[tokio::test]
async fn empty_transcription_fails_the_turn_without_reaching_the_agent() {
    let calls = Arc::new(AtomicUsize::new(0));
    let (pipeline, _persistence) = pipeline_with(
        Arc::new(FailingTranscriber),
        Arc::new(StubAgent { reply: "unreachable".to_string(), delay: None, calls: calls.clone() }),
        PipelineTimeouts::default(),
    );

    let audio = AudioBuffer::new(loud_wav(16000), AudioFormat::Wav, 16000);
    let settings = settings_vad_disabled();
    let mut context = ConversationContext::new("session-1");
    let (tx, rx) = mpsc::channel(32);

    let turn = pipeline
        .run_turn("session-1", audio, &settings, &mut context, CancellationToken::new(), tx, "default", 1.0)
        .await;

    let events = drain(rx).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        events[0],
        PipelineEvent::Error { ref reason, ref stage } if reason == "no_transcription" && stage.as_deref() == Some("asr")
    ));
    assert_eq!(turn.error.as_deref(), Some("no_transcription"));
}

#[tokio::test]
async fn a_cached_reply_is_reused_without_calling_the_agent_again() {
    let calls = Arc::new(AtomicUsize::new(0));
    let persistence = Arc::new(RecordingPersistence::default());
    let cache = Arc::new(InMemoryResponseCache::new());
    let collaborators = Collaborators {
        transcriber: Arc::new(StubTranscriber { reply: "what is the weather".to_string() }),
        agent: Arc::new(StubAgent { reply: "It is sunny.".to_string(), delay: None, calls: calls.clone() }),
        synthesizer: Arc::new(StubSynthesizer),
        cache: cache.clone() as Arc<dyn ResponseCache>,
        persistence: persistence.clone() as Arc<dyn TurnPersistence>,
        codec: Arc::new(WavPassthroughDecoder),
    };
    let pipeline = TurnPipeline::new(Arc::new(collaborators), PipelineTimeouts::default());

    let settings = settings_vad_disabled();

    let mut context = ConversationContext::new("session-1");
    let (tx, rx) = mpsc::channel(32);
    let turn = pipeline
        .run_turn(
            "session-1",
            AudioBuffer::new(loud_wav(16000), AudioFormat::Wav, 16000),
            &settings,
            &mut context,
            CancellationToken::new(),
            tx,
            "default",
            1.0,
        )
        .await;
    drain(rx).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(turn.agent_text, "It is sunny.");

    // Second turn, same transcript: the agent must not be called again.
    let mut context = ConversationContext::new("session-1");
    let (tx, rx) = mpsc::channel(32);
    let turn = pipeline
        .run_turn(
            "session-1",
            AudioBuffer::new(loud_wav(16000), AudioFormat::Wav, 16000),
            &settings,
            &mut context,
            CancellationToken::new(),
            tx,
            "default",
            1.0,
        )
        .await;
    let events = drain(rx).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1, "cached reply must skip Agent.Respond");
    assert_eq!(turn.agent_text, "It is sunny.");
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::TtsChunk { .. })));
}

#[tokio::test]
async fn agent_timeout_surfaces_a_timeout_error_at_the_agent_stage() {
    let (pipeline, _persistence) = pipeline_with(
        Arc::new(StubTranscriber { reply: "hello".to_string() }),
        Arc::new(NeverRespondingAgent),
        PipelineTimeouts { agent: Duration::from_millis(20), ..PipelineTimeouts::default() },
    );

    let audio = AudioBuffer::new(loud_wav(16000), AudioFormat::Wav, 16000);
    let settings = settings_vad_disabled();
    let mut context = ConversationContext::new("session-1");
    let (tx, rx) = mpsc::channel(32);

    let turn = pipeline
        .run_turn("session-1", audio, &settings, &mut context, CancellationToken::new(), tx, "default", 1.0)
        .await;

    let events = drain(rx).await;
    assert!(events.iter().any(
        |e| matches!(e, PipelineEvent::Error { reason, stage } if reason == "timeout" && stage.as_deref() == Some("agent"))
    ));
    assert_eq!(turn.error.as_deref(), Some("timeout"));
}
