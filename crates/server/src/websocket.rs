//! The single WebSocket endpoint (C5) and per-connection reader/writer tasks
//! (C4). One writer task per session owns the socket's send half and is the
//! only path outbound frames travel through (spec §4.4 "Writer discipline").

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::sleep;

use voice_agent_config::constants::session as session_constants;
use voice_agent_core::{AudioBuffer, ClientEvent, ServerEvent, SessionState};
use voice_agent_pipeline::PipelineEvent;

use crate::session::Session;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub user_id: Option<String>,
}

/// Upgrades a connection, checking the origin allowlist and session capacity
/// first (spec §4.5, §8 "Max-sessions+1 connection ⇒ upgrade refused"). Both
/// checks happen before `ws.on_upgrade` so a refused client gets a plain HTTP
/// status instead of a socket that's accepted and then silently dropped.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !origin_allowed(&state, &headers) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    if !state.registry.has_capacity() {
        return (StatusCode::SERVICE_UNAVAILABLE, "connection_limit").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user_id))
}

fn origin_allowed(state: &AppState, headers: &HeaderMap) -> bool {
    let allowlist = &state.config.server.origin_allowlist;
    if allowlist.is_empty() {
        return true;
    }
    match headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
        Some(origin) => allowlist.iter().any(|allowed| allowed == origin),
        None => false,
    }
}

const CONNECTED_RETRY_ATTEMPTS: u32 = session_constants::CONNECTED_RETRY_ATTEMPTS;
const CONNECTED_RETRY_BACKOFF_MS: u64 = session_constants::CONNECTED_RETRY_BACKOFF_MS;
const SHUTDOWN_GRACE_MS: u64 = session_constants::SLOW_CONSUMER_GRACE_MS;

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Option<String>) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let capacity = state.config.server.outbound_channel_capacity;

    let session = Arc::new(Session::new(&session_id, user_id, capacity));
    // Re-checked here to cover the race between the pre-upgrade capacity
    // check and this insert; losing the race at this point still means the
    // upgrade already happened, so the socket is dropped rather than
    // refused with a status code.
    if state.registry.insert(session.clone()).is_err() {
        tracing::warn!(session_id, "rejecting connection: registry at capacity");
        return;
    }

    let (mut ws_tx, ws_rx) = socket.split();

    // Handshake: emit `connected` immediately, retrying past the occasional
    // race where the transport isn't writable yet right after accept.
    let connected = ServerEvent::Connected {
        session_id: session_id.clone(),
        timestamp: Utc::now().timestamp_millis(),
    };
    let mut handshake_ok = false;
    for attempt in 0..CONNECTED_RETRY_ATTEMPTS {
        match ws_tx.send(Message::Text(connected.to_json().expect("ServerEvent always serializes"))).await {
            Ok(()) => {
                handshake_ok = true;
                break;
            },
            Err(e) => {
                tracing::warn!(session_id, attempt, error = %e, "connected handshake send failed");
                sleep(Duration::from_millis(CONNECTED_RETRY_BACKOFF_MS)).await;
            },
        }
    }
    if !handshake_ok {
        state.registry.remove(&session_id);
        return;
    }
    session.set_state(SessionState::Idle);
    crate::metrics::record_session_connected();

    let writer = tokio::spawn(writer_task(ws_tx, session.clone()));
    reader_loop(ws_rx, session.clone(), state.clone()).await;

    session.cancel_current_turn();
    sleep(Duration::from_millis(SHUTDOWN_GRACE_MS)).await;
    writer.abort();
    seal_orphaned_turn(&state, &session).await;
    state.registry.remove(&session_id);
    tracing::info!(session_id, "session closed");
}

/// If a turn was in flight when the connection dropped, the Turn Pipeline's
/// own timeout/cancel path seals it; this only covers the narrower case of a
/// turn opened but never appended because the process is shutting the
/// connection down before the pipeline task got to persist it.
async fn seal_orphaned_turn(state: &AppState, session: &Session) {
    if !session.has_in_flight_turn() {
        return;
    }
    let pending = match state.turn_log.get_session(&session.id).await {
        Ok(turns) => turns.into_iter().rev().find(|t| !t.is_sealed()),
        Err(_) => None,
    };
    if let Some(mut turn) = pending {
        turn.error = Some("disconnect".to_string());
        turn.seal(Utc::now());
        if let Err(e) = state.turn_log.append(&turn).await {
            tracing::warn!(session_id = %session.id, error = %e, "failed to seal orphaned turn on disconnect");
        }
    }
}

/// Drains the outbound queue and is the only task that writes to the
/// socket. Overflow handling (drop-oldest-control, then disconnect) lives
/// in `Session`'s queue; once it reports overflow this task sends
/// `slow_consumer` and closes.
async fn writer_task(mut ws_tx: futures::stream::SplitSink<WebSocket, Message>, session: Arc<Session>) {
    loop {
        match session.recv_outbound().await {
            Some(event) => {
                let Ok(json) = event.to_json() else { continue };
                if ws_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            },
            None => {
                let _ = ws_tx
                    .send(Message::Text(ServerEvent::error("slow_consumer").to_json().unwrap_or_default()))
                    .await;
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            },
        }
    }
}

async fn reader_loop(mut ws_rx: futures::stream::SplitStream<WebSocket>, session: Arc<Session>, state: AppState) {
    let mut pending_audio: Vec<u8> = Vec::new();
    let mut pending_format = voice_agent_core::AudioFormat::Wav;
    let mut pending_sample_rate = 16_000u32;
    let mut queued_final: Option<AudioBuffer> = None;

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                if session.should_log_error("ws_read") {
                    tracing::warn!(session_id = %session.id, error = %e, "websocket read error");
                }
                break;
            },
        };

        let text = match message {
            Message::Text(t) => t,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => {
                session.write(ServerEvent::error("unsupported_binary"));
                continue;
            },
        };

        session.touch();
        // A payload that isn't even valid JSON is `bad_frame`; valid JSON
        // whose `event` tag/shape doesn't match any `ClientEvent` variant is
        // `unknown_event` (spec §7 taxonomy, scenario 6).
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => {
                session.write(ServerEvent::error("bad_frame"));
                continue;
            },
        };
        let event: ClientEvent = match serde_json::from_value(value) {
            Ok(e) => e,
            Err(_) => {
                session.write(ServerEvent::error("unknown_event"));
                continue;
            },
        };

        match event {
            ClientEvent::AudioChunk {
                audio_chunk,
                format,
                sample_rate,
                is_final,
                ..
            } => {
                let Ok(bytes) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &audio_chunk) else {
                    session.write(ServerEvent::error_at_stage("invalid_audio_chunk", "decode"));
                    continue;
                };
                pending_audio.extend_from_slice(&bytes);
                pending_format = format;
                pending_sample_rate = sample_rate;

                if !is_final {
                    continue;
                }

                let buffer = AudioBuffer::new(std::mem::take(&mut pending_audio), pending_format, pending_sample_rate);

                if session.state() == SessionState::Transcribing || session.state() == SessionState::Generating {
                    // Barge-in: the newest final buffer wins (spec §4.4).
                    session.cancel_current_turn();
                    queued_final = Some(buffer);
                    continue;
                }

                if session.state() == SessionState::Speaking {
                    session.cancel_current_turn();
                }

                spawn_turn(session.clone(), state.clone(), buffer);
            },
            ClientEvent::Interrupt { .. } => {
                session.set_state(SessionState::Cancelling);
                session.cancel_current_turn();
            },
            ClientEvent::SettingsUpdate { fields } => match session.settings().merged_with(&fields) {
                Ok(merged) => {
                    session.set_settings(merged);
                    session.write(ServerEvent::SettingsAck { settings: session.settings() });
                },
                Err(e) => {
                    session.write(ServerEvent::error_at_stage(e.to_string(), "settings_update"));
                },
            },
            ClientEvent::Ping { ts } => {
                session.write(ServerEvent::Pong { ts });
            },
        }

        if let Some(buffer) = queued_final.take() {
            if !session.has_in_flight_turn() {
                spawn_turn(session.clone(), state.clone(), buffer);
            } else {
                queued_final = Some(buffer);
            }
        }

        if session.outbound_overflowed() {
            break;
        }
    }
}

fn spawn_turn(session: Arc<Session>, state: AppState, audio: AudioBuffer) {
    session.set_state(SessionState::Transcribing);
    let cancel = session.begin_turn();
    let (event_tx, mut event_rx) = mpsc::channel::<PipelineEvent>(32);

    let forward_session = session.clone();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            handle_pipeline_event(&forward_session, event);
        }
    });

    tokio::spawn(async move {
        let settings = session.settings();
        let voice = state.config.collaborators.tts_voice_default.clone();
        let rate = state.config.collaborators.tts_rate_default;

        let turn = {
            let mut context_owned = session.context.lock().clone();
            let turn = state
                .pipeline
                .run_turn(&session.id, audio, &settings, &mut context_owned, cancel, event_tx, &voice, rate)
                .await;
            *session.context.lock() = context_owned;
            turn
        };

        session.end_turn();
        crate::metrics::record_turn_completed(turn.processing_time_ms.unwrap_or(0), turn.interrupted);
        if turn.interrupted {
            session.set_state(SessionState::Listening);
        } else {
            session.set_state(SessionState::Idle);
        }
    });
}

fn handle_pipeline_event(session: &Arc<Session>, event: PipelineEvent) {
    let now = Utc::now().timestamp_millis();
    let frame = match event {
        PipelineEvent::Transcription { text } => {
            session.set_state(SessionState::Transcribing);
            Some(ServerEvent::Transcription { text, timestamp: now })
        },
        PipelineEvent::AgentResponse { text } => {
            session.set_state(SessionState::Generating);
            Some(ServerEvent::AgentResponse { text, timestamp: now })
        },
        PipelineEvent::TtsChunk { audio, chunk_index, format } => {
            session.set_state(SessionState::Speaking);
            let audio_chunk = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &audio);
            Some(ServerEvent::TtsChunk { audio_chunk, chunk_index, format, timestamp: now })
        },
        PipelineEvent::StreamingComplete { chunks_sent, duration_ms } => {
            Some(ServerEvent::StreamingComplete { chunks_sent, duration_ms })
        },
        PipelineEvent::StreamingInterrupted { chunks_sent } => Some(ServerEvent::StreamingInterrupted { chunks_sent }),
        PipelineEvent::ValidationRejected { reason, energy, speech_ratio } => {
            Some(ServerEvent::ValidationRejected { reason, energy, speech_ratio })
        },
        PipelineEvent::Error { reason, stage } => {
            crate::metrics::record_turn_error(&reason);
            if session.should_log_error("pipeline") {
                tracing::warn!(session_id = %session.id, reason = %reason, stage = ?stage, "turn failed");
            }
            match stage {
                Some(stage) => Some(ServerEvent::error_at_stage(reason, stage)),
                None => Some(ServerEvent::error(reason)),
            }
        },
    };

    if let Some(frame) = frame {
        session.write(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_params_user_id_defaults_to_none() {
        let params: ConnectParams = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(params.user_id.is_none());
    }
}
