use std::collections::{BTreeMap, HashMap};
use std::env;
use std::io::{BufRead, BufReader, Read};

use serde_json::{Value, json};
use tracing::{debug, trace};

use super::common::{empty_assistant_message, is_loopback_base_url, join_url};
use crate::AssistantMessageEventStream;
use crate::error::{AiError, AiErrorCode};
use crate::transport_retry::{DEFAULT_TRANSPORT_RETRY_COUNT, retry_transport_operation};
use crate::types::{
    AssistantContentBlock, AssistantMessageEvent, Context, DoneReason, ErrorReason, Message,
    Model, StopReason, StreamOptions, Tool, Usage,
};

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

pub(crate) async fn run_openai_completions(
    client: reqwest::Client,
    model: Model,
    context: Context,
    options: Option<StreamOptions>,
    stream: AssistantMessageEventStream,
) -> Result<(), AiError> {
    let api_key = resolve_api_key(&model, options.as_ref())?;

    let mut output = empty_assistant_message(&model);
    let payload = build_openai_payload(&model, &context, options.as_ref());
    let endpoint = join_url(&model.base_url, "chat/completions");
    let headers = options
        .as_ref()
        .and_then(|options| options.headers.clone())
        .unwrap_or_default();
    let retries = options
        .as_ref()
        .and_then(|options| options.transport_retry_count)
        .unwrap_or(DEFAULT_TRANSPORT_RETRY_COUNT);

    debug!(
        model = model.id.as_str(),
        messages = context.messages.len(),
        "sending chat completion request"
    );
    trace!("chat completion payload: {}", payload);

    let execution = async {
        let body = retry_transport_operation(retries, || {
            fetch_completion_body(
                &client,
                endpoint.as_str(),
                api_key.as_deref(),
                &headers,
                &payload,
            )
        })
        .await?;

        stream.push(AssistantMessageEvent::Start {
            partial: output.clone(),
        });

        let mut text_block_index: Option<usize> = None;
        let mut pending_tool_calls: BTreeMap<usize, PendingToolCall> = BTreeMap::new();
        let mut reader = std::io::Cursor::new(body.into_bytes());
        process_sse_data_events(&mut reader, |data| {
            trace!("chat completion chunk: {}", data);
            if data == "[DONE]" {
                return Ok(true);
            }

            let chunk: Value = serde_json::from_str(&data).map_err(|error| {
                AiError::new(
                    AiErrorCode::ProviderProtocol,
                    format!("Invalid chat completion chunk JSON: {error}"),
                )
                .with_details(json!({ "chunk": data }))
            })?;

            if let Some(usage_value) = chunk.get("usage") {
                update_usage(&mut output.usage, usage_value);
            }

            let Some(choice) = chunk
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|choices| choices.first())
            else {
                // usage-only trailer chunks carry no choices
                return Ok(false);
            };

            if let Some(finish_reason) = choice.get("finish_reason").and_then(Value::as_str) {
                output.stop_reason = map_stop_reason(finish_reason);
            }

            let delta = choice.get("delta").and_then(Value::as_object);
            if let Some(content_delta) = delta
                .and_then(|delta| delta.get("content"))
                .and_then(Value::as_str)
                .filter(|content| !content.is_empty())
            {
                let idx = *text_block_index.get_or_insert_with(|| {
                    output.content.push(AssistantContentBlock::Text {
                        text: String::new(),
                    });
                    output.content.len() - 1
                });
                if let Some(AssistantContentBlock::Text { text }) = output.content.get_mut(idx) {
                    text.push_str(content_delta);
                }
                stream.push(AssistantMessageEvent::TextDelta {
                    content_index: idx,
                    delta: content_delta.to_string(),
                    partial: output.clone(),
                });
            }

            if let Some(tool_calls) = delta
                .and_then(|delta| delta.get("tool_calls"))
                .and_then(Value::as_array)
            {
                for tool_call in tool_calls {
                    let provider_index = tool_call
                        .get("index")
                        .and_then(Value::as_u64)
                        .map(|value| value as usize)
                        .unwrap_or(0);
                    let pending = pending_tool_calls.entry(provider_index).or_default();
                    if let Some(id) = tool_call.get("id").and_then(Value::as_str) {
                        pending.id = id.to_string();
                    }
                    let function = tool_call.get("function").and_then(Value::as_object);
                    if let Some(name) = function
                        .and_then(|function| function.get("name"))
                        .and_then(Value::as_str)
                    {
                        pending.name = name.to_string();
                    }
                    if let Some(arguments) = function
                        .and_then(|function| function.get("arguments"))
                        .and_then(Value::as_str)
                    {
                        pending.arguments.push_str(arguments);
                    }
                }
            }

            Ok(false)
        })?;

        for (provider_index, pending) in pending_tool_calls {
            let id = if pending.id.is_empty() {
                format!("call_{provider_index}")
            } else {
                pending.id
            };
            let arguments = parse_tool_arguments(&pending.arguments);
            output.content.push(AssistantContentBlock::ToolCall {
                id: id.clone(),
                name: pending.name.clone(),
                arguments: arguments.clone(),
            });
            stream.push(AssistantMessageEvent::ToolcallEnd {
                content_index: output.content.len() - 1,
                tool_call: json!({
                    "type": "toolCall",
                    "id": id,
                    "name": pending.name,
                    "arguments": arguments,
                }),
                partial: output.clone(),
            });
        }

        let has_tool_calls = output
            .content
            .iter()
            .any(|block| matches!(block, AssistantContentBlock::ToolCall { .. }));
        if has_tool_calls && output.stop_reason == StopReason::Stop {
            output.stop_reason = StopReason::ToolUse;
        }

        let done_reason = map_done_reason(&output.stop_reason).ok_or_else(|| {
            AiError::new(
                AiErrorCode::ProviderProtocol,
                "Chat completion ended with non-terminal stop reason",
            )
        })?;

        stream.push(AssistantMessageEvent::Done {
            reason: done_reason,
            message: output.clone(),
        });
        Ok::<(), AiError>(())
    }
    .await;

    if let Err(error) = execution {
        output.stop_reason = StopReason::Error;
        output.error_message = Some(error.as_compact_json());
        stream.push(AssistantMessageEvent::Error {
            reason: ErrorReason::Error,
            error: output,
        });
    }

    Ok(())
}

async fn fetch_completion_body(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: Option<&str>,
    headers: &HashMap<String, String>,
    payload: &Value,
) -> Result<String, AiError> {
    let mut request = client
        .post(endpoint)
        .header("Content-Type", "application/json");
    if let Some(api_key) = api_key {
        request = request.header("Authorization", format!("Bearer {api_key}"));
    }
    for (name, value) in headers {
        request = request.header(name, value);
    }

    let response = request.json(payload).send().await.map_err(|error| {
        AiError::new(
            AiErrorCode::ProviderTransport,
            format!("Chat completion transport failed: {error}"),
        )
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read error body".to_string());
        return Err(AiError::new(
            AiErrorCode::ProviderHttp,
            format!("Chat completion HTTP {}: {body}", status.as_u16()),
        )
        .with_details(json!({ "status": status.as_u16() })));
    }

    response.text().await.map_err(|error| {
        AiError::new(
            AiErrorCode::ProviderTransport,
            format!("Chat completion stream read failed: {error}"),
        )
    })
}

fn build_openai_payload(model: &Model, context: &Context, options: Option<&StreamOptions>) -> Value {
    let mut payload = json!({
        "model": model.id,
        "stream": true,
        "messages": convert_messages(context),
    });

    if let Some(max_tokens) = options.and_then(|options| options.max_tokens) {
        payload["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = options.and_then(|options| options.temperature) {
        payload["temperature"] = json!(temperature);
    }
    if let Some(tools) = context.tools.as_ref().filter(|tools| !tools.is_empty()) {
        payload["tools"] = convert_tools(tools);
        if let Some(tool_choice) = options.and_then(|options| options.tool_choice) {
            payload["tool_choice"] = json!(tool_choice.as_str());
        }
    }

    payload
}

fn convert_messages(context: &Context) -> Vec<Value> {
    let mut messages = Vec::new();

    if let Some(system_prompt) = &context.system_prompt {
        messages.push(json!({
            "role": "system",
            "content": system_prompt,
        }));
    }

    for message in &context.messages {
        match message {
            Message::User { content, .. } => {
                messages.push(json!({
                    "role": "user",
                    "content": content,
                }));
            }
            Message::Assistant { content, .. } => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in content {
                    match block {
                        AssistantContentBlock::Text { text } => text_parts.push(text.clone()),
                        AssistantContentBlock::ToolCall {
                            id,
                            name,
                            arguments,
                        } => {
                            tool_calls.push(json!({
                                "id": id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": arguments.to_string(),
                                }
                            }));
                        }
                    }
                }

                let mut assistant_message = json!({
                    "role": "assistant",
                    "content": if text_parts.is_empty() { Value::Null } else { Value::String(text_parts.join("\n")) },
                });
                if !tool_calls.is_empty() {
                    assistant_message["tool_calls"] = Value::Array(tool_calls);
                }
                messages.push(assistant_message);
            }
            Message::ToolResult {
                tool_call_id,
                tool_name,
                content,
                ..
            } => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "name": tool_name,
                    "content": if content.is_empty() { "(no text result)" } else { content.as_str() },
                }));
            }
        }
    }

    messages
}

fn convert_tools(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect(),
    )
}

/// Local OpenAI-compatible servers (Ollama, llama.cpp) accept requests without a key.
fn resolve_api_key(model: &Model, options: Option<&StreamOptions>) -> Result<Option<String>, AiError> {
    if let Some(api_key) = options
        .and_then(|options| options.api_key.clone())
        .filter(|key| !key.trim().is_empty())
    {
        return Ok(Some(api_key));
    }

    let provider_env = format!("{}_API_KEY", model.provider.to_uppercase().replace('-', "_"));
    for name in [provider_env.as_str(), "OPENAI_API_KEY"] {
        if let Ok(value) = env::var(name) {
            if !value.trim().is_empty() {
                return Ok(Some(value));
            }
        }
    }

    if is_loopback_base_url(&model.base_url) {
        return Ok(None);
    }

    Err(AiError::new(
        AiErrorCode::ProviderAuthMissing,
        format!(
            "Missing API key for provider '{}'. Set [llm].api_key or {} / OPENAI_API_KEY.",
            model.provider, provider_env
        ),
    ))
}

fn process_sse_data_events<R, F>(reader: &mut R, mut on_data: F) -> Result<(), AiError>
where
    R: Read,
    F: FnMut(String) -> Result<bool, AiError>,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut data_lines: Vec<String> = Vec::new();

    let mut emit_event = |lines: &mut Vec<String>| -> Result<bool, AiError> {
        if lines.is_empty() {
            return Ok(false);
        }
        let data = lines.join("\n");
        lines.clear();
        on_data(data)
    };

    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line).map_err(|error| {
            AiError::new(
                AiErrorCode::ProviderTransport,
                format!("Chat completion stream read failed: {error}"),
            )
        })?;

        if bytes_read == 0 {
            let _ = emit_event(&mut data_lines)?;
            return Ok(());
        }

        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            if emit_event(&mut data_lines)? {
                return Ok(());
            }
            continue;
        }

        if let Some(data) = trimmed.strip_prefix("data:") {
            data_lines.push(data.trim_start().to_string());
        }
    }
}

fn parse_tool_arguments(buffer: &str) -> Value {
    if buffer.trim().is_empty() {
        return json!({});
    }
    // Unparseable arguments are kept verbatim so schema validation reports them.
    serde_json::from_str::<Value>(buffer).unwrap_or_else(|_| Value::String(buffer.to_string()))
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "stop" => StopReason::Stop,
        "length" => StopReason::Length,
        "function_call" | "tool_calls" => StopReason::ToolUse,
        "content_filter" => StopReason::Error,
        _ => StopReason::Stop,
    }
}

fn map_done_reason(reason: &StopReason) -> Option<DoneReason> {
    match reason {
        StopReason::Stop => Some(DoneReason::Stop),
        StopReason::Length => Some(DoneReason::Length),
        StopReason::ToolUse => Some(DoneReason::ToolUse),
        StopReason::Error | StopReason::Aborted => None,
    }
}

fn update_usage(usage: &mut Usage, value: &Value) {
    usage.input = value
        .get("prompt_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(usage.input);
    usage.output = value
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(usage.output);
    usage.total_tokens = usage.input + usage.output;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolChoice;
    use std::io::{self, Read};

    fn sample_model(base_url: &str) -> Model {
        Model {
            id: "qwen2.5:7b".to_string(),
            name: "qwen2.5:7b".to_string(),
            provider: "ollama".to_string(),
            base_url: base_url.to_string(),
            context_window: 32_768,
            max_tokens: 4_096,
        }
    }

    fn sample_context() -> Context {
        Context {
            system_prompt: Some("You are a SQL expert.".to_string()),
            messages: vec![
                Message::User {
                    content: "How many students?".to_string(),
                    timestamp: 0,
                },
                Message::Assistant {
                    content: vec![AssistantContentBlock::ToolCall {
                        id: "sql_db_list_tables".to_string(),
                        name: "sql_db_list_tables".to_string(),
                        arguments: json!({}),
                    }],
                    model: "qwen2.5:7b".to_string(),
                    usage: Usage::default(),
                    stop_reason: StopReason::ToolUse,
                    error_message: None,
                    timestamp: 1,
                },
                Message::ToolResult {
                    tool_call_id: "sql_db_list_tables".to_string(),
                    tool_name: "sql_db_list_tables".to_string(),
                    content: "students".to_string(),
                    is_error: false,
                    timestamp: 2,
                },
            ],
            tools: Some(vec![Tool {
                name: "sql_db_query".to_string(),
                description: "Run a query".to_string(),
                parameters: json!({ "type": "object" }),
            }]),
        }
    }

    #[test]
    fn payload_carries_tools_tool_choice_and_temperature() {
        let options = StreamOptions {
            temperature: Some(0.0),
            tool_choice: Some(ToolChoice::Required),
            ..StreamOptions::default()
        };
        let payload = build_openai_payload(
            &sample_model("http://localhost:11434/v1"),
            &sample_context(),
            Some(&options),
        );

        assert_eq!(payload["tool_choice"], "required");
        assert_eq!(payload["temperature"], 0.0);
        assert_eq!(payload["tools"][0]["function"]["name"], "sql_db_query");
        let messages = payload["messages"].as_array().expect("messages");
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "sql_db_list_tables");
    }

    #[test]
    fn tool_choice_is_omitted_without_tools() {
        let mut context = sample_context();
        context.tools = None;
        let options = StreamOptions {
            tool_choice: Some(ToolChoice::Required),
            ..StreamOptions::default()
        };
        let payload = build_openai_payload(
            &sample_model("http://localhost:11434/v1"),
            &context,
            Some(&options),
        );

        assert!(payload.get("tool_choice").is_none());
        assert!(payload.get("tools").is_none());
    }

    #[test]
    fn loopback_models_do_not_require_api_key() {
        let model = Model {
            provider: "sqlpilot-test-loopback".to_string(),
            ..sample_model("http://127.0.0.1:11434/v1")
        };
        if env::var("OPENAI_API_KEY").is_ok() {
            return;
        }
        assert_eq!(resolve_api_key(&model, None), Ok(None));

        let options = StreamOptions {
            api_key: Some("sk-test".to_string()),
            ..StreamOptions::default()
        };
        assert_eq!(
            resolve_api_key(&model, Some(&options)),
            Ok(Some("sk-test".to_string()))
        );
    }

    #[test]
    fn remote_models_without_key_fail_with_auth_missing() {
        if env::var("OPENAI_API_KEY").is_ok() {
            return;
        }
        let model = Model {
            provider: "sqlpilot-test-remote".to_string(),
            ..sample_model("https://llm.example.com/v1")
        };
        let error = resolve_api_key(&model, None).expect_err("key should be required");
        assert_eq!(error.code, AiErrorCode::ProviderAuthMissing);
    }

    #[test]
    fn process_sse_data_events_stops_reading_after_done_event() {
        struct FailAfterDoneReader {
            chunks: Vec<&'static [u8]>,
            cursor: usize,
        }

        impl Read for FailAfterDoneReader {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.cursor >= self.chunks.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "reader should not be polled after [DONE]",
                    ));
                }

                let chunk = self.chunks[self.cursor];
                self.cursor += 1;
                buf[..chunk.len()].copy_from_slice(chunk);
                Ok(chunk.len())
            }
        }

        let mut reader = FailAfterDoneReader {
            chunks: vec![b"data: first\n\n", b"data: [DONE]\n\n"],
            cursor: 0,
        };
        let mut events = Vec::new();

        let result = process_sse_data_events(&mut reader, |data| {
            let is_done = data == "[DONE]";
            events.push(data);
            Ok(is_done)
        });

        assert!(result.is_ok(), "unexpected parse error: {result:?}");
        assert_eq!(events, vec!["first".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn tool_arguments_fall_back_to_raw_text_when_not_json() {
        assert_eq!(parse_tool_arguments(""), json!({}));
        assert_eq!(
            parse_tool_arguments("{\"query\":\"SELECT 1\"}"),
            json!({ "query": "SELECT 1" })
        );
        assert_eq!(
            parse_tool_arguments("{\"query\":"),
            Value::String("{\"query\":".to_string())
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_reported_as_error_event() {
        let stream = AssistantMessageEventStream::new();
        let options = StreamOptions {
            transport_retry_count: Some(0),
            ..StreamOptions::default()
        };
        run_openai_completions(
            reqwest::Client::new(),
            sample_model("http://127.0.0.1:9/v1"),
            sample_context(),
            Some(options),
            stream.clone(),
        )
        .await
        .expect("provider errors surface as events");

        let message = stream.result().await.expect("terminal message");
        assert_eq!(message.stop_reason, StopReason::Error);
        let error = AiError::from_compact_json(message.error_message.as_deref().unwrap_or(""))
            .expect("compact error");
        assert_eq!(error.code, AiErrorCode::ProviderTransport);
    }
}
