use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sqlpilot_agent_core::{
    AgentMessage, CheckpointError, CheckpointStore, ConversationState, ensure_append_only,
};
use tracing::debug;

const SESSION_VERSION: u32 = 1;
const MAX_CACHED_SESSIONS: usize = 32;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct SessionHeader {
    #[serde(rename = "type")]
    type_field: String,
    version: u32,
    id: String,
    timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct SessionEntry {
    #[serde(rename = "type")]
    type_field: String,
    message: AgentMessage,
}

/// Most recently used session states, oldest evicted first. The files stay
/// the source of truth; a miss just rereads one.
#[derive(Default)]
struct StateCache {
    states: HashMap<String, ConversationState>,
    order: VecDeque<String>,
}

impl StateCache {
    fn get(&self, session_id: &str) -> Option<&ConversationState> {
        self.states.get(session_id)
    }

    fn insert(&mut self, state: ConversationState) {
        self.order.retain(|id| id != &state.session_id);
        self.order.push_back(state.session_id.clone());
        self.states.insert(state.session_id.clone(), state);
        while self.order.len() > MAX_CACHED_SESSIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }
}

/// Checkpoints stored as one JSONL file per session: a header line followed by
/// one line per message, only ever appended to.
pub struct JsonlCheckpointStore {
    dir: PathBuf,
    cache: Mutex<StateCache>,
}

impl JsonlCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            cache: Mutex::new(StateCache::default()),
        })
    }

    pub fn session_file(&self, session_id: &str) -> PathBuf {
        let file_name: String = session_id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file_name}.jsonl"))
    }

    fn read_state(&self, session_id: &str) -> Result<Option<ConversationState>, CheckpointError> {
        let path = self.session_file(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let file = OpenOptions::new().read(true).open(&path)?;
        let mut lines = BufReader::new(file).lines();

        let header_line = lines
            .next()
            .ok_or_else(|| invalid_data(format!("session file {} is empty", path.display())))??;
        let header: SessionHeader = serde_json::from_str(&header_line)?;
        if header.id != session_id {
            return Err(invalid_data(format!(
                "session file {} belongs to session '{}'",
                path.display(),
                header.id
            ))
            .into());
        }

        let mut state = ConversationState::new(session_id);
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: SessionEntry = serde_json::from_str(&line)?;
            state.push(entry.message);
        }
        Ok(Some(state))
    }

    fn persist_header(&self, path: &Path, session_id: &str) -> Result<(), CheckpointError> {
        let header = SessionHeader {
            type_field: "session".to_string(),
            version: SESSION_VERSION,
            id: session_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(serde_json::to_string(&header)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn append_entries(&self, path: &Path, messages: &[AgentMessage]) -> Result<(), CheckpointError> {
        let mut buffer = String::new();
        for message in messages {
            let entry = SessionEntry {
                type_field: "message".to_string(),
                message: message.clone(),
            };
            buffer.push_str(&serde_json::to_string(&entry)?);
            buffer.push('\n');
        }
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(buffer.as_bytes())?;
        Ok(())
    }
}

impl CheckpointStore for JsonlCheckpointStore {
    fn load(&self, session_id: &str) -> Result<Option<ConversationState>, CheckpointError> {
        let mut cache = self.cache.lock().expect("checkpoint cache mutex poisoned");
        if let Some(state) = cache.get(session_id) {
            return Ok(Some(state.clone()));
        }
        let state = self.read_state(session_id)?;
        if let Some(state) = &state {
            cache.insert(state.clone());
        }
        Ok(state)
    }

    fn save(&self, state: &ConversationState) -> Result<(), CheckpointError> {
        let mut cache = self.cache.lock().expect("checkpoint cache mutex poisoned");
        let stored = match cache.get(&state.session_id) {
            Some(stored) => Some(stored.clone()),
            None => self.read_state(&state.session_id)?,
        };
        ensure_append_only(stored.as_ref(), state)?;

        let path = self.session_file(&state.session_id);
        let already_written = match &stored {
            Some(stored) => stored.history.len(),
            None => {
                self.persist_header(&path, &state.session_id)?;
                0
            }
        };
        let fresh = &state.history[already_written..];
        if !fresh.is_empty() {
            self.append_entries(&path, fresh)?;
        }
        debug!(
            session_id = state.session_id.as_str(),
            appended = fresh.len(),
            total = state.history.len(),
            "checkpoint saved"
        );
        cache.insert(state.clone());
        Ok(())
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
