//! Turn Pipeline (C3): runs exactly one user turn from a closed audio buffer
//! through validation, transcription, generation, and streamed synthesis,
//! honoring cancellation at every suspension point (spec §4.3, §5).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use voice_agent_core::{AudioBuffer, PcmAudio, Turn, TtsAudioFormat, VoiceSettings};

use crate::adapters::{Collaborators, ConversationContext};
use crate::validator::{self, ValidatorConfig};
use crate::PipelineError;

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '\n'];
const STREAMING_BUFFER_CHAR_LIMIT: usize = 100;
/// How long a cached agent reply is reused for the same transcript, matching
/// the teacher's own 5-minute default for its response caches.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Emitted by the pipeline as a turn progresses. The session/broker layer
/// turns these into the wire-level `ServerEvent`s (adding timestamps and
/// base64-encoding audio), keeping the pipeline itself transport-agnostic.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Transcription {
        text: String,
    },
    AgentResponse {
        text: String,
    },
    TtsChunk {
        audio: Vec<u8>,
        chunk_index: u32,
        format: TtsAudioFormat,
    },
    StreamingComplete {
        chunks_sent: u32,
        duration_ms: u64,
    },
    StreamingInterrupted {
        chunks_sent: u32,
    },
    ValidationRejected {
        reason: String,
        energy: f64,
        speech_ratio: f64,
    },
    Error {
        reason: String,
        stage: Option<String>,
    },
}

/// Per-adapter and whole-turn timeouts (spec §5).
#[derive(Debug, Clone, Copy)]
pub struct PipelineTimeouts {
    pub asr: Duration,
    pub agent: Duration,
    pub tts: Duration,
    pub turn_budget: Duration,
}

impl Default for PipelineTimeouts {
    fn default() -> Self {
        Self {
            asr: Duration::from_secs(10),
            agent: Duration::from_secs(30),
            tts: Duration::from_secs(30),
            turn_budget: Duration::from_secs(60),
        }
    }
}

pub struct TurnPipeline {
    collaborators: Arc<Collaborators>,
    timeouts: PipelineTimeouts,
}

type TtsTaskHandle = JoinHandle<Vec<Result<Vec<u8>, PipelineError>>>;

impl TurnPipeline {
    pub fn new(collaborators: Arc<Collaborators>, timeouts: PipelineTimeouts) -> Self {
        Self {
            collaborators,
            timeouts,
        }
    }

    /// Runs one turn to completion or interruption, returning the sealed
    /// `Turn` record. Always seals and persists the turn, even on early
    /// failure, so every code path is accounted for in the Turn Log.
    pub async fn run_turn(
        &self,
        session_id: &str,
        audio: AudioBuffer,
        settings: &VoiceSettings,
        context: &mut ConversationContext,
        cancel: CancellationToken,
        events: mpsc::Sender<PipelineEvent>,
        voice: &str,
        tts_rate: f32,
    ) -> Turn {
        let mut turn = Turn::open(session_id, Utc::now());

        let budget = self.timeouts.turn_budget;
        let ran = timeout(
            budget,
            self.run_turn_inner(session_id, audio, settings, context, &cancel, &events, &mut turn, voice, tts_rate),
        )
        .await;

        if ran.is_err() {
            cancel.cancel();
            warn!(session_id, turn_id = %turn.turn_id, "turn exceeded whole-turn budget");
            let _ = events
                .send(PipelineEvent::Error {
                    reason: "timeout".to_string(),
                    stage: Some("turn".to_string()),
                })
                .await;
            turn.error.get_or_insert_with(|| "timeout".to_string());
        }

        if !turn.is_sealed() {
            turn.seal(Utc::now());
        }

        self.persist(&turn).await;
        turn
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_turn_inner(
        &self,
        session_id: &str,
        audio: AudioBuffer,
        settings: &VoiceSettings,
        context: &mut ConversationContext,
        cancel: &CancellationToken,
        events: &mpsc::Sender<PipelineEvent>,
        turn: &mut Turn,
        voice: &str,
        tts_rate: f32,
    ) {
        // Stage 1: decode to canonical PCM WAV.
        let pcm = match self.collaborators.codec.decode(&audio.bytes, audio.format) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!(session_id, error = %e, "audio decode failed");
                self.emit_error(events, "decode_failed", "decode").await;
                turn.error = Some("decode_failed".to_string());
                turn.seal(Utc::now());
                return;
            },
        };

        // Stage 2: validate. On reject, seal with empty transcription and
        // return without calling ASR.
        let cfg = ValidatorConfig {
            energy_threshold: settings.backend_energy_threshold,
            vad_enabled: settings.backend_vad_enabled,
            vad_mode: settings.backend_vad_mode,
            speech_ratio_threshold: settings.backend_speech_ratio_threshold,
        };
        let pcm_bytes = pcm_to_le_bytes(&pcm.samples);
        let (accepted, metrics) = validator::validate(&pcm_bytes, pcm.sample_rate, &cfg);
        if !accepted {
            info!(session_id, reason = ?metrics.reason, "validation rejected");
            let _ = events
                .send(PipelineEvent::ValidationRejected {
                    reason: metrics.reason.clone().unwrap_or_else(|| "decode_error".to_string()),
                    energy: metrics.energy_rms,
                    speech_ratio: metrics.speech_ratio,
                })
                .await;
            turn.seal(Utc::now());
            return;
        }

        // Stage 3: log acceptance.
        info!(
            session_id,
            energy = metrics.energy_rms,
            speech_ratio = metrics.speech_ratio,
            bytes = audio.bytes.len(),
            "VAD_ACCEPTED"
        );

        if cancel.is_cancelled() {
            self.finish_cancelled(events, turn, 0).await;
            return;
        }

        // Stage 4/5: transcribe.
        let transcript = match timeout(self.timeouts.asr, self.collaborators.transcriber.transcribe(&pcm)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => {
                self.emit_error(events, "no_transcription", "asr").await;
                turn.error = Some("no_transcription".to_string());
                turn.seal(Utc::now());
                return;
            },
            Ok(Err(e)) => {
                warn!(session_id, error = %e, "asr call failed");
                self.emit_error(events, "no_transcription", "asr").await;
                turn.error = Some("no_transcription".to_string());
                turn.seal(Utc::now());
                return;
            },
            Err(_) => {
                self.emit_error(events, "timeout", "asr").await;
                turn.error = Some("timeout".to_string());
                turn.seal(Utc::now());
                return;
            },
        };

        turn.transcription = transcript.clone();
        let _ = events.send(PipelineEvent::Transcription { text: transcript.clone() }).await;

        if cancel.is_cancelled() {
            self.finish_cancelled(events, turn, 0).await;
            return;
        }

        // Stage 6: generate, buffering fragments and kicking off TTS at each
        // sentence boundary so synthesis overlaps generation (spec §4.3
        // "Streaming mode"). Fragment-level errors/cancellation abort before
        // any frame beyond `transcription` is observable, matching the
        // non-streaming failure semantics ("Agent error: same [as ASR]: no
        // TTS"). A cache hit on the transcript (spec §4.2 "Cache.Get/Put")
        // skips Agent.Respond entirely and goes straight to synthesis.
        let cache_key = transcript.trim().to_lowercase();
        let mut agent_text = String::new();
        let mut sentence_buffer = String::new();
        let mut tts_tasks: Vec<TtsTaskHandle> = Vec::new();

        if let Some(cached) = self.collaborators.cache.get(&cache_key).await {
            agent_text = cached;
            sentence_buffer.push_str(&agent_text);
        } else {
            let mut agent_stream = self.collaborators.agent.respond_stream(&transcript, context);

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        abort_all(&tts_tasks);
                        self.finish_cancelled(events, turn, 0).await;
                        return;
                    }
                    fragment = timeout(self.timeouts.agent, agent_stream.next()) => fragment,
                };

                match next {
                    Ok(Some(Ok(fragment))) => {
                        agent_text.push_str(&fragment);
                        sentence_buffer.push_str(&fragment);
                        self.drain_sentences(&mut sentence_buffer, voice, tts_rate, &mut tts_tasks, false, cancel);
                    },
                    Ok(Some(Err(e))) => {
                        warn!(session_id, error = %e, "agent call failed");
                        abort_all(&tts_tasks);
                        self.emit_error(events, "agent_failed", "agent").await;
                        turn.error = Some("agent_failed".to_string());
                        turn.seal(Utc::now());
                        return;
                    },
                    Ok(None) => break,
                    Err(_) => {
                        abort_all(&tts_tasks);
                        self.emit_error(events, "timeout", "agent").await;
                        turn.error = Some("timeout".to_string());
                        turn.seal(Utc::now());
                        return;
                    },
                }
            }

            self.collaborators.cache.put(&cache_key, agent_text.clone(), CACHE_TTL).await;
        }
        self.drain_sentences(&mut sentence_buffer, voice, tts_rate, &mut tts_tasks, true, cancel);

        context.push(transcript, agent_text.clone());
        turn.agent_text = agent_text.clone();

        // Stage 7: emit the full text even though synthesis may already be
        // underway, preserving the outbound order transcription ->
        // agent_response -> tts_chunk*.
        let _ = events.send(PipelineEvent::AgentResponse { text: agent_text }).await;

        if cancel.is_cancelled() {
            abort_all(&tts_tasks);
            self.finish_cancelled(events, turn, 0).await;
            return;
        }

        // Stage 8/9: drain synthesis tasks in the order they were started,
        // emitting one `tts_chunk` per audio chunk with a strictly
        // monotonic, contiguous `chunk_index`.
        let mut chunk_index: u32 = 0;
        let mut interrupted = false;
        let mut tts_failed = false;

        for mut task in tts_tasks {
            if cancel.is_cancelled() {
                task.abort();
                interrupted = true;
                continue;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    task.abort();
                    interrupted = true;
                    continue;
                }
                joined = &mut task => joined,
            };
            let chunks = match joined {
                Ok(chunks) => chunks,
                Err(_) => {
                    interrupted = true;
                    continue;
                },
            };

            for chunk in chunks {
                if cancel.is_cancelled() {
                    interrupted = true;
                    break;
                }
                match chunk {
                    Ok(bytes) => {
                        let _ = events
                            .send(PipelineEvent::TtsChunk {
                                audio: bytes,
                                chunk_index,
                                format: TtsAudioFormat::Opus,
                            })
                            .await;
                        chunk_index += 1;
                    },
                    Err(e) => {
                        warn!(session_id, error = %e, "tts call failed");
                        self.emit_error(events, "tts_failed", "tts").await;
                        tts_failed = true;
                        break;
                    },
                }
            }

            if tts_failed {
                break;
            }
        }

        turn.tts_chunks_sent = chunk_index;

        if interrupted || cancel.is_cancelled() {
            turn.interrupted = true;
            turn.seal(Utc::now());
            let _ = events.send(PipelineEvent::StreamingInterrupted { chunks_sent: chunk_index }).await;
        } else if tts_failed {
            turn.interrupted = true;
            turn.error = Some("tts_failed".to_string());
            turn.seal(Utc::now());
            let _ = events.send(PipelineEvent::StreamingInterrupted { chunks_sent: chunk_index }).await;
        } else {
            turn.seal(Utc::now());
            let duration_ms = turn.processing_time_ms.unwrap_or(0);
            let _ = events
                .send(PipelineEvent::StreamingComplete { chunks_sent: chunk_index, duration_ms })
                .await;
        }
    }

    /// Pulls complete sentences (or ~100-char overflows, or the final
    /// flush) off `buffer` and spawns one synthesis task per sentence.
    fn drain_sentences(
        &self,
        buffer: &mut String,
        voice: &str,
        tts_rate: f32,
        tasks: &mut Vec<TtsTaskHandle>,
        flush: bool,
        cancel: &CancellationToken,
    ) {
        loop {
            let boundary = find_sentence_boundary(buffer).or_else(|| {
                if flush || buffer.chars().count() > STREAMING_BUFFER_CHAR_LIMIT {
                    Some(buffer.len().saturating_sub(1))
                } else {
                    None
                }
            });

            let Some(boundary) = boundary else { break };
            if buffer.is_empty() {
                break;
            }

            let sentence: String = buffer.drain(..=boundary.min(buffer.len() - 1)).collect();
            let sentence = sentence.trim().to_string();
            if sentence.is_empty() {
                continue;
            }

            tasks.push(self.spawn_synthesis(sentence, voice.to_string(), tts_rate, cancel.clone()));

            if !flush {
                continue;
            }
            if buffer.trim().is_empty() {
                break;
            }
        }

        if flush && !buffer.trim().is_empty() {
            let sentence = std::mem::take(buffer).trim().to_string();
            tasks.push(self.spawn_synthesis(sentence, voice.to_string(), tts_rate, cancel.clone()));
        }
    }

    /// Synthesizes one sentence in its own task so synthesis overlaps
    /// generation of later sentences. The per-chunk loop races against
    /// `cancel` so a barge-in stops this task within one outstanding chunk,
    /// not only once the whole sentence has finished synthesizing.
    fn spawn_synthesis(
        &self,
        sentence: String,
        voice: String,
        tts_rate: f32,
        cancel: CancellationToken,
    ) -> TtsTaskHandle {
        let synthesizer = self.collaborators.synthesizer.clone();
        tokio::spawn(async move {
            let mut stream = synthesizer.synthesize_stream(&sentence, &voice, tts_rate);
            let mut chunks = Vec::new();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(chunk) => chunks.push(chunk),
                        None => break,
                    },
                }
            }
            chunks
        })
    }

    async fn emit_error(&self, events: &mpsc::Sender<PipelineEvent>, reason: &str, stage: &str) {
        let _ = events
            .send(PipelineEvent::Error {
                reason: reason.to_string(),
                stage: Some(stage.to_string()),
            })
            .await;
    }

    async fn finish_cancelled(&self, events: &mpsc::Sender<PipelineEvent>, turn: &mut Turn, chunks_sent: u32) {
        turn.interrupted = true;
        turn.tts_chunks_sent = chunks_sent;
        turn.seal(Utc::now());
        let _ = events.send(PipelineEvent::StreamingInterrupted { chunks_sent }).await;
    }

    async fn persist(&self, turn: &Turn) {
        if let Err(e) = self.collaborators.persistence.append_turn(turn).await {
            warn!(turn_id = %turn.turn_id, error = %e, "failed to persist turn");
        }
    }
}

fn abort_all(tasks: &[TtsTaskHandle]) {
    for task in tasks {
        task.abort();
    }
}

fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// First sentence-terminating character not immediately preceded by a digit
/// (avoids splitting "3.14" mid-number); returns its byte index.
fn find_sentence_boundary(text: &str) -> Option<usize> {
    for (i, c) in text.char_indices() {
        if SENTENCE_TERMINATORS.contains(&c) {
            if c == '.' {
                let prev_is_digit = text[..i].chars().last().map(|p| p.is_ascii_digit()).unwrap_or(false);
                let next_is_digit = text[i + c.len_utf8()..].chars().next().map(|n| n.is_ascii_digit()).unwrap_or(false);
                if prev_is_digit && next_is_digit {
                    continue;
                }
            }
            return Some(i);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_simple_sentence_boundary() {
        assert_eq!(find_sentence_boundary("Hello there. More text"), Some(11));
    }

    #[test]
    fn skips_decimal_point() {
        assert_eq!(find_sentence_boundary("3.14 is pi"), None);
    }

    #[test]
    fn finds_question_mark() {
        assert_eq!(find_sentence_boundary("How about Tesla?"), Some(15));
    }

    #[test]
    fn returns_none_without_terminator() {
        assert_eq!(find_sentence_boundary("no terminator here"), None);
    }
}
