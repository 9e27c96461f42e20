//! Provider-agnostic LLM types and the OpenAI-compatible chat provider used by sqlpilot.

mod error;
mod event_stream;
mod providers;
mod stream;
mod transport_retry;
mod types;
mod validation;

pub use error::{AiError, AiErrorCode};
pub use event_stream::{AssistantMessageEventStream, EventStream};
pub use stream::{ChatClient, error_from_message};
pub use transport_retry::DEFAULT_TRANSPORT_RETRY_COUNT;
pub use types::{
    AssistantContentBlock, AssistantMessage, AssistantMessageEvent, Context, DoneReason,
    ErrorReason, Message, Model, StopReason, StreamOptions, Tool, ToolChoice, Usage,
};
pub use validation::{ToolCall, validate_tool_arguments};
