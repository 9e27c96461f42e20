use std::time::Instant;

use serde_json::Value;
use sqlpilot_ai::{
    AiError, AiErrorCode, AssistantMessageEvent, Context, Message, Model, StreamOptions,
    ToolChoice, error_from_message, validate_tool_arguments,
};
use tracing::{debug, warn};

use crate::capability::{Capability, ToolRequest, generation_tools};
use crate::types::{AgentEvent, AgentEventSink, AgentMessage, StreamFn, now_millis};

pub(crate) struct GenerationRequest<'a> {
    pub stream_fn: &'a StreamFn,
    pub model: &'a Model,
    pub system_prompt: &'a str,
    pub options: &'a StreamOptions,
    pub event_sink: Option<&'a AgentEventSink>,
}

pub(crate) struct GenerationOutcome {
    /// The assistant message followed by one observation per rejected call.
    pub messages: Vec<AgentMessage>,
    pub rejected_calls: usize,
    pub duration_ms: u64,
}

/// Asks the model for the next action and checks every tool call it made.
pub(crate) async fn generate(
    request: GenerationRequest<'_>,
    history: &[AgentMessage],
) -> Result<GenerationOutcome, AiError> {
    let started_at = Instant::now();
    let context = Context {
        system_prompt: Some(request.system_prompt.to_string()),
        messages: history.to_vec(),
        tools: Some(generation_tools()),
    };
    let options = StreamOptions {
        tool_choice: Some(ToolChoice::Required),
        temperature: request.options.temperature.or(Some(0.0)),
        ..request.options.clone()
    };

    let response = request
        .stream_fn
        .stream(request.model.clone(), context, Some(options))?;

    let mut assistant = None;
    while let Some(event) = response.next().await {
        match &event {
            AssistantMessageEvent::Done { message, .. } => {
                assistant = Some(message.clone());
                break;
            }
            AssistantMessageEvent::Error { error, .. } => {
                return Err(error_from_message(error));
            }
            AssistantMessageEvent::Start { .. }
            | AssistantMessageEvent::TextDelta { .. }
            | AssistantMessageEvent::ToolcallEnd { .. } => {
                if let Some(sink) = request.event_sink {
                    sink(AgentEvent::AssistantUpdate {
                        assistant_message_event: event.clone(),
                    });
                }
            }
        }
    }

    let assistant = assistant
        .ok_or_else(|| {
            AiError::new(
                AiErrorCode::ProviderProtocol,
                "Assistant stream ended without terminal event",
            )
        })?
        .into_message();

    let observations = review_tool_calls(&assistant);
    let duration_ms = started_at.elapsed().as_millis() as u64;
    debug!(
        model = request.model.id.as_str(),
        tool_calls = assistant.tool_calls().len(),
        rejected_calls = observations.len(),
        duration_ms,
        "query generation finished"
    );

    let rejected_calls = observations.len();
    let mut messages = Vec::with_capacity(rejected_calls + 1);
    messages.push(assistant);
    messages.extend(observations);
    Ok(GenerationOutcome {
        messages,
        rejected_calls,
        duration_ms,
    })
}

/// Error observations for calls the generation step does not accept.
fn review_tool_calls(assistant: &AgentMessage) -> Vec<AgentMessage> {
    assistant
        .tool_calls()
        .into_iter()
        .filter_map(|call| {
            let content = match Capability::parse(&call.name) {
                Some(capability @ (Capability::RunQuery | Capability::FinalResponse)) => {
                    let error = validate_tool_arguments(&capability.to_tool(), &call).err()?;
                    format!(
                        "Error: Invalid arguments for {}: {}. Please fix your mistakes.",
                        call.name,
                        validation_details(&error)
                    )
                }
                _ => format!(
                    "Error: The wrong tool was called: {}. Please fix your mistakes.",
                    call.name
                ),
            };
            warn!(
                tool = call.name.as_str(),
                tool_call_id = call.id.as_str(),
                "rejected tool call from model"
            );
            Some(rejection(&call, content))
        })
        .collect()
}

fn validation_details(error: &AiError) -> String {
    error
        .details
        .as_ref()
        .and_then(|details| details.get("validationErrors"))
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|joined| !joined.is_empty())
        .unwrap_or_else(|| error.message.clone())
}

fn rejection(call: &ToolRequest, content: String) -> AgentMessage {
    Message::ToolResult {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        content,
        is_error: true,
        timestamp: now_millis(),
    }
}
