//! The Turn Log (C6): append-only, file-backed storage for sealed `Turn`
//! records. One line-delimited JSON file per UTC day for the stream, one
//! JSON document per session rewritten atomically on every append, so
//! `get_session` never reads a torn file (spec §4.6, §6 "Persisted state
//! layout").

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use voice_agent_core::Turn;
use voice_agent_pipeline::{PipelineError, TurnPersistence};

use crate::error::PersistenceError;

#[async_trait]
pub trait TurnLog: Send + Sync {
    /// Appends a sealed turn. Called exactly once per sealed turn; a second
    /// call with the same `turn_id` is rejected (idempotency key = `turn_id`).
    async fn append(&self, turn: &Turn) -> Result<(), PersistenceError>;

    /// All turns for a session, in start order.
    async fn get_session(&self, session_id: &str) -> Result<Vec<Turn>, PersistenceError>;

    /// A single turn by id, if it has been appended.
    async fn get_turn(&self, turn_id: &str) -> Result<Option<Turn>, PersistenceError>;
}

/// Writes are serialized per log directory via `write_lock`; reads take a
/// lock-free snapshot of whatever is on disk at call time.
pub struct FileTurnLog {
    log_dir: PathBuf,
    write_lock: Mutex<()>,
    seen_turn_ids: DashMap<String, ()>,
}

impl FileTurnLog {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            write_lock: Mutex::new(()),
            seen_turn_ids: DashMap::new(),
        }
    }

    fn daily_log_path(&self, turn: &Turn) -> PathBuf {
        self.log_dir.join(format!("turns_{}.jsonl", turn.started_at.format("%Y%m%d")))
    }

    fn session_doc_path(&self, session_id: &str) -> PathBuf {
        self.log_dir.join(format!("session_{session_id}.json"))
    }

    async fn append_daily_line(&self, turn: &Turn) -> Result<(), PersistenceError> {
        use tokio::io::AsyncWriteExt;

        fs::create_dir_all(&self.log_dir).await?;
        let mut line = serde_json::to_string(turn)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.daily_log_path(turn))
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn rewrite_session_document(&self, turn: &Turn) -> Result<(), PersistenceError> {
        let path = self.session_doc_path(&turn.session_id);
        let mut turns = read_turns(&path).await?;
        turns.push(turn.clone());

        let tmp_path = self.log_dir.join(format!(".session_{}.json.tmp", turn.session_id));
        let body = serde_json::to_vec_pretty(&turns)?;
        fs::write(&tmp_path, body).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}

async fn read_turns(path: &Path) -> Result<Vec<Turn>, PersistenceError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl TurnLog for FileTurnLog {
    async fn append(&self, turn: &Turn) -> Result<(), PersistenceError> {
        if self.seen_turn_ids.contains_key(&turn.turn_id) {
            return Err(PersistenceError::DuplicateTurn(turn.turn_id.clone()));
        }

        let _guard = self.write_lock.lock().await;
        if self.seen_turn_ids.contains_key(&turn.turn_id) {
            return Err(PersistenceError::DuplicateTurn(turn.turn_id.clone()));
        }

        self.append_daily_line(turn).await?;
        self.rewrite_session_document(turn).await?;
        self.seen_turn_ids.insert(turn.turn_id.clone(), ());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Vec<Turn>, PersistenceError> {
        read_turns(&self.session_doc_path(session_id)).await
    }

    async fn get_turn(&self, turn_id: &str) -> Result<Option<Turn>, PersistenceError> {
        fs::create_dir_all(&self.log_dir).await?;
        let mut entries = fs::read_dir(&self.log_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("session_") || !name.ends_with(".json") {
                continue;
            }
            let turns = read_turns(&entry.path()).await?;
            if let Some(turn) = turns.into_iter().find(|t| t.turn_id == turn_id) {
                return Ok(Some(turn));
            }
        }
        Ok(None)
    }
}

/// Lets the Turn Pipeline depend only on the narrow `TurnPersistence` seam
/// (spec §4.2) without knowing about daily files or session documents.
#[async_trait]
impl TurnPersistence for FileTurnLog {
    async fn append_turn(&self, turn: &Turn) -> Result<(), PipelineError> {
        match self.append(turn).await {
            Ok(()) => Ok(()),
            Err(PersistenceError::DuplicateTurn(id)) => {
                warn!(turn_id = %id, "duplicate turn append suppressed");
                Ok(())
            },
            Err(e) => Err(PipelineError::Persistence(e.to_string())),
        }
    }
}
