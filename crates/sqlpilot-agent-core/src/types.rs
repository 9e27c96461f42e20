use std::sync::Arc;

use sqlpilot_ai::{AiError, AssistantMessageEvent, AssistantMessageEventStream, Context, Message, Model, StreamOptions};

use crate::graph::Stage;

pub type AgentMessage = Message;

/// Anything that can turn a model request into an assistant event stream.
///
/// Closures with the matching signature implement it, which is how tests plug
/// in scripted models.
pub trait StreamExecutor: Send + Sync {
    fn stream(
        &self,
        model: Model,
        context: Context,
        options: Option<StreamOptions>,
    ) -> Result<AssistantMessageEventStream, AiError>;
}

impl<F> StreamExecutor for F
where
    F: Fn(Model, Context, Option<StreamOptions>) -> Result<AssistantMessageEventStream, AiError>
        + Send
        + Sync
        + 'static,
{
    fn stream(
        &self,
        model: Model,
        context: Context,
        options: Option<StreamOptions>,
    ) -> Result<AssistantMessageEventStream, AiError> {
        (self)(model, context, options)
    }
}

pub type StreamFn = Arc<dyn StreamExecutor>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentRunMetrics {
    pub stage_executions: usize,
    pub generation_count: usize,
    pub generation_total_ms: u64,
    pub tool_execution_count: usize,
    pub tool_execution_total_ms: u64,
    pub recovered_error_count: usize,
}

#[derive(Clone, Debug)]
pub enum AgentEvent {
    TurnStart {
        session_id: String,
    },
    StageStart {
        stage: Stage,
    },
    MessageAppended {
        message: AgentMessage,
    },
    AssistantUpdate {
        assistant_message_event: AssistantMessageEvent,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
        duration_ms: u64,
    },
    Metrics {
        metrics: AgentRunMetrics,
    },
    TurnEnd {
        session_id: String,
    },
}

pub type AgentEventSink = Arc<dyn Fn(AgentEvent) + Send + Sync>;

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
