//! SQL agent control loop built on top of `sqlpilot-ai`.

mod agent;
mod capability;
mod checkpoint;
mod database;
mod error;
mod generation;
mod graph;
mod prompt;
mod reply;
mod stages;
mod types;

pub use agent::{AgentConfig, SessionConfig, SqlAgent, TurnOutcome};
pub use capability::{Capability, FinalAnswer, ToolRequest, generation_tools};
pub use checkpoint::{
    CheckpointError, CheckpointStore, ConversationState, MemoryCheckpointStore, ensure_append_only,
};
pub use database::{AdapterError, SqlDatabase};
pub use error::AgentError;
pub use graph::{DEFAULT_RECURSION_LIMIT, IterationBudget, RoutingDecision, Stage, route};
pub use prompt::system_prompt;
pub use reply::{AgentReply, extract_reply};
pub use stages::{ToolExecution, execute_tool_requests, force_get_schema, force_list_tables};
pub use types::{AgentEvent, AgentEventSink, AgentMessage, AgentRunMetrics, StreamExecutor, StreamFn};
