use sqlpilot_ai::AiError;
use thiserror::Error;

use crate::checkpoint::CheckpointError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("user input is empty")]
    EmptyInput,
    #[error("agent stopped after reaching the recursion limit of {limit} steps")]
    RecursionLimit { limit: usize },
    #[error("model request failed: {0}")]
    Model(#[from] AiError),
    #[error("checkpoint store failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl AgentError {
    /// Budget exhaustion is a soft stop; the caller reports it as a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::RecursionLimit { .. })
    }
}
