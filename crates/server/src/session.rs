//! The Session (C4): per-connection state machine, voice settings, and the
//! single outbound queue a connection's writer task drains (spec §4.4).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use voice_agent_core::{ServerEvent, SessionState, VoiceSettings};
use voice_agent_pipeline::ConversationContext;

use crate::ServerError;

const ERROR_LOG_THROTTLE: Duration = Duration::from_secs(1);

/// Bounded outbound queue enforcing the writer discipline of spec §4.4: on
/// overflow, drop the oldest frame that isn't a `tts_chunk` to make room;
/// if every queued frame is audio, the connection is past saving and the
/// writer disconnects with `slow_consumer` instead of blocking the pipeline.
struct OutboundQueue {
    events: Mutex<VecDeque<ServerEvent>>,
    capacity: usize,
    notify: Notify,
    overflowed: AtomicBool,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            overflowed: AtomicBool::new(false),
        }
    }

    fn push(&self, event: ServerEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            match events.iter().position(|e| !matches!(e, ServerEvent::TtsChunk { .. })) {
                Some(pos) => {
                    events.remove(pos);
                },
                None => {
                    self.overflowed.store(true, Ordering::Relaxed);
                    return;
                },
            }
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
    }

    async fn recv(&self) -> Option<ServerEvent> {
        loop {
            {
                let mut events = self.events.lock();
                if let Some(event) = events.pop_front() {
                    return Some(event);
                }
                if self.overflowed.load(Ordering::Relaxed) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }
}

pub struct Session {
    pub id: String,
    /// Opaque client-supplied identity from the connect handshake (spec §3
    /// "Session" identity: `session_id` and `user_id`). Absent when the
    /// client connects without a `user_id` query parameter.
    pub user_id: Option<String>,
    state: RwLock<SessionState>,
    settings: RwLock<VoiceSettings>,
    pub context: Mutex<ConversationContext>,
    current_turn_cancel: RwLock<Option<CancellationToken>>,
    outbound: OutboundQueue,
    created_at: Instant,
    last_activity: RwLock<Instant>,
    last_logged: DashMap<&'static str, Instant>,
}

impl Session {
    pub fn new(id: impl Into<String>, user_id: Option<String>, outbound_capacity: usize) -> Self {
        let id = id.into();
        Self {
            context: Mutex::new(ConversationContext::new(&id)),
            id,
            user_id,
            state: RwLock::new(SessionState::Connecting),
            settings: RwLock::new(VoiceSettings::default()),
            current_turn_cancel: RwLock::new(None),
            outbound: OutboundQueue::new(outbound_capacity),
            created_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            last_logged: DashMap::new(),
        }
    }

    /// Gates a repeated-error log line to at most once per second per error
    /// kind (spec §5), so a burst of identical adapter failures doesn't
    /// flood the log.
    pub fn should_log_error(&self, kind: &'static str) -> bool {
        let now = Instant::now();
        match self.last_logged.get(kind) {
            Some(last) if now.duration_since(*last) < ERROR_LOG_THROTTLE => false,
            _ => {
                self.last_logged.insert(kind, now);
                true
            },
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    pub fn settings(&self) -> VoiceSettings {
        *self.settings.read()
    }

    pub fn set_settings(&self, settings: VoiceSettings) {
        *self.settings.write() = settings;
    }

    /// Registers the cancel token of a newly started turn, replacing (and
    /// implicitly superseding) any previous one.
    pub fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current_turn_cancel.write() = Some(token.clone());
        token
    }

    pub fn end_turn(&self) {
        *self.current_turn_cancel.write() = None;
    }

    /// Cancels the in-flight turn, if any; used by `interrupt` and by
    /// barge-in when a new final buffer arrives while Speaking.
    pub fn cancel_current_turn(&self) {
        if let Some(token) = self.current_turn_cancel.read().as_ref() {
            token.cancel();
        }
    }

    pub fn has_in_flight_turn(&self) -> bool {
        self.current_turn_cancel.read().is_some()
    }

    /// Enqueues a frame for the writer task. Never blocks: overflow is
    /// handled by `OutboundQueue`'s drop/disconnect policy, not by
    /// backpressuring the caller.
    pub fn write(&self, event: ServerEvent) {
        self.outbound.push(event);
    }

    /// Drains the next outbound frame, or `None` once the connection has
    /// been marked for `slow_consumer` disconnect.
    pub(crate) async fn recv_outbound(&self) -> Option<ServerEvent> {
        self.outbound.recv().await
    }

    pub(crate) fn outbound_overflowed(&self) -> bool {
        self.outbound.is_overflowed()
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.read().elapsed() > timeout
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// The registry the Broker inserts into and removes from (spec §4.5); read
/// access is lock-free once a session has an `Arc` handle in hand.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            idle_timeout,
        }
    }

    pub fn insert(&self, session: Arc<Session>) -> Result<(), ServerError> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            return Err(ServerError::AtCapacity);
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.sessions.write().remove(id);
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Checked before `ws.on_upgrade`, mirroring the origin pre-upgrade check,
    /// so a connection refused for capacity never completes the WebSocket
    /// handshake in the first place.
    pub fn has_capacity(&self) -> bool {
        self.sessions.read().len() < self.max_sessions
    }

    fn cleanup_expired(&self) {
        let timeout = self.idle_timeout;
        let expired: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| s.is_idle(timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            self.sessions.write().remove(&id);
            tracing::info!(session_id = %id, "removed idle session");
        }
    }

    /// Spawns a background task that periodically evicts idle sessions.
    /// Returns a sender the caller can use to stop the task.
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.cleanup_expired(),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(id: &str) -> Arc<Session> {
        Arc::new(Session::new(id, None, 8))
    }

    #[tokio::test]
    async fn outbound_drops_oldest_control_frame_before_overflowing() {
        let session = test_session("a");
        for i in 0..8 {
            session.write(ServerEvent::Pong { ts: i });
        }
        session.write(ServerEvent::error("ninth"));
        let first = session.recv_outbound().await.unwrap();
        assert!(matches!(first, ServerEvent::Pong { ts: 1 }));
        assert!(!session.outbound_overflowed());
    }

    #[tokio::test]
    async fn outbound_marks_overflow_when_queue_is_all_audio() {
        let session = test_session("a");
        for i in 0..8 {
            session.write(ServerEvent::TtsChunk {
                audio_chunk: String::new(),
                chunk_index: i,
                format: voice_agent_core::TtsAudioFormat::Mp3,
                timestamp: 0,
            });
        }
        session.write(ServerEvent::error("overflow"));
        assert!(session.outbound_overflowed());
    }

    #[test]
    fn registry_rejects_insert_past_capacity() {
        let registry = SessionRegistry::new(1, Duration::from_secs(60));
        registry.insert(test_session("a")).unwrap();
        let err = registry.insert(test_session("b")).unwrap_err();
        assert!(matches!(err, ServerError::AtCapacity));
    }

    #[test]
    fn registry_has_capacity_reflects_insert_outcome_before_it_happens() {
        let registry = SessionRegistry::new(1, Duration::from_secs(60));
        assert!(registry.has_capacity());
        registry.insert(test_session("a")).unwrap();
        assert!(!registry.has_capacity());
    }

    #[test]
    fn registry_get_and_remove() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        let session = test_session("a");
        registry.insert(session.clone()).unwrap();
        assert!(registry.get("a").is_some());
        registry.remove("a");
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn begin_turn_then_cancel_signals_token() {
        let session = test_session("a");
        let token = session.begin_turn();
        assert!(session.has_in_flight_turn());
        session.cancel_current_turn();
        assert!(token.is_cancelled());
        session.end_turn();
        assert!(!session.has_in_flight_turn());
    }

    #[test]
    fn new_session_starts_idle_only_after_touch_resets() {
        let session = test_session("a");
        assert!(!session.is_idle(Duration::from_secs(60)));
    }
}
