//! The Turn record: one user utterance through to reply completion or
//! interruption (spec §3). Owned by the Turn Log once sealed; the Turn
//! Pipeline builds one per in-flight turn and hands it off for persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub transcription: String,
    pub agent_text: String,
    pub tts_chunks_sent: u32,
    pub processing_time_ms: Option<u64>,
    pub error: Option<String>,
    pub interrupted: bool,
}

impl Turn {
    /// Opens a new, unsealed turn at ASR-accept (spec §3: "Created at
    /// ASR-accept"). `turn_id` is generated here rather than by the caller so
    /// that the Turn Log's idempotency key is always produced consistently.
    pub fn open(session_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            turn_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            started_at,
            ended_at: None,
            transcription: String::new(),
            agent_text: String::new(),
            tts_chunks_sent: 0,
            processing_time_ms: None,
            error: None,
            interrupted: false,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Seals the turn at `ended_at`, fixing `processing_time_ms` from the
    /// elapsed wall time. Once sealed a `Turn` is append-only (I3/I4 from
    /// §8): callers must not mutate a sealed turn in place.
    pub fn seal(&mut self, ended_at: DateTime<Utc>) {
        let elapsed = (ended_at - self.started_at).num_milliseconds().max(0) as u64;
        self.processing_time_ms = Some(elapsed);
        self.ended_at = Some(ended_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn open_turn_is_not_sealed() {
        let turn = Turn::open("session-1", Utc::now());
        assert!(!turn.is_sealed());
        assert!(turn.ended_at.is_none());
    }

    #[test]
    fn seal_computes_processing_time() {
        let started = Utc::now();
        let mut turn = Turn::open("session-1", started);
        let ended = started + Duration::milliseconds(420);
        turn.seal(ended);
        assert!(turn.is_sealed());
        assert_eq!(turn.processing_time_ms, Some(420));
    }

    #[test]
    fn interrupted_turn_retains_partial_progress() {
        let mut turn = Turn::open("session-1", Utc::now());
        turn.tts_chunks_sent = 3;
        turn.interrupted = true;
        turn.seal(Utc::now());
        assert!(turn.interrupted);
        assert_eq!(turn.tts_chunks_sent, 3);
    }
}
