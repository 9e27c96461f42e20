use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AgentMessage;

/// Everything persisted for a session: its append-only message history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub session_id: String,
    pub history: Vec<AgentMessage>,
}

impl ConversationState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            history: Vec::new(),
        }
    }

    pub fn last(&self) -> Option<&AgentMessage> {
        self.history.last()
    }

    pub fn push(&mut self, message: AgentMessage) {
        self.history.push(message);
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint data is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("history for session '{session_id}' does not extend the stored history")]
    Diverged { session_id: String },
}

/// Durable storage for conversation state, keyed by session id.
///
/// `save` replaces the stored state, but only with a history that extends the
/// one already held.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, session_id: &str) -> Result<Option<ConversationState>, CheckpointError>;

    fn save(&self, state: &ConversationState) -> Result<(), CheckpointError>;
}

/// Fails unless `next` keeps `stored` as an unchanged prefix.
pub fn ensure_append_only(
    stored: Option<&ConversationState>,
    next: &ConversationState,
) -> Result<(), CheckpointError> {
    let Some(stored) = stored else {
        return Ok(());
    };
    let extends = stored.history.len() <= next.history.len()
        && stored
            .history
            .iter()
            .zip(next.history.iter())
            .all(|(old, new)| old == new);
    if extends {
        Ok(())
    } else {
        Err(CheckpointError::Diverged {
            session_id: next.session_id.clone(),
        })
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    sessions: Mutex<HashMap<String, ConversationState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, session_id: &str) -> Result<Option<ConversationState>, CheckpointError> {
        let sessions = self.sessions.lock().expect("checkpoint mutex poisoned");
        Ok(sessions.get(session_id).cloned())
    }

    fn save(&self, state: &ConversationState) -> Result<(), CheckpointError> {
        let mut sessions = self.sessions.lock().expect("checkpoint mutex poisoned");
        ensure_append_only(sessions.get(&state.session_id), state)?;
        sessions.insert(state.session_id.clone(), state.clone());
        Ok(())
    }
}
