use std::time::Duration;

use crate::AssistantMessageEventStream;
use crate::error::{AiError, AiErrorCode};
use crate::providers::{is_loopback_base_url, now_millis, run_openai_completions};
use crate::types::{AssistantMessage, Context, ErrorReason, Model, StopReason, StreamOptions, Usage};

/// Client for an OpenAI-compatible chat completions endpoint.
///
/// Build one per configured model at startup and share it; the underlying
/// HTTP connection pool is reused across requests.
#[derive(Clone, Debug)]
pub struct ChatClient {
    http: reqwest::Client,
}

impl ChatClient {
    pub fn new(base_url: &str) -> Self {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if is_loopback_base_url(base_url) {
            builder = builder.no_proxy();
        }
        let http = builder.build().unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    pub fn stream(
        &self,
        model: Model,
        context: Context,
        options: Option<StreamOptions>,
    ) -> Result<AssistantMessageEventStream, AiError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            AiError::new(
                AiErrorCode::ProviderProtocol,
                "Model streaming requires a running tokio runtime",
            )
        })?;

        let stream = AssistantMessageEventStream::new();
        let task_stream = stream.clone();
        let client = self.http.clone();
        handle.spawn(async move {
            let error_model = model.clone();
            let result =
                run_openai_completions(client, model, context, options, task_stream.clone()).await;
            if let Err(error) = result {
                task_stream.push(crate::types::AssistantMessageEvent::Error {
                    reason: ErrorReason::Error,
                    error: transport_error_message(&error_model, error),
                });
            }
            task_stream.end(None);
        });
        Ok(stream)
    }
}

/// Recovers the provider error carried by a failed assistant message.
pub fn error_from_message(message: &AssistantMessage) -> AiError {
    let raw = message.error_message.as_deref().unwrap_or_default();
    AiError::from_compact_json(raw).unwrap_or_else(|| {
        AiError::new(
            AiErrorCode::ProviderProtocol,
            if raw.is_empty() {
                "Model response failed without an error message".to_string()
            } else {
                raw.to_string()
            },
        )
    })
}

fn transport_error_message(model: &Model, error: AiError) -> AssistantMessage {
    AssistantMessage {
        content: vec![],
        provider: model.provider.clone(),
        model: model.id.clone(),
        usage: Usage::default(),
        stop_reason: StopReason::Error,
        error_message: Some(error.as_compact_json()),
        timestamp: now_millis(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_from_message_decodes_compact_error() {
        let model = Model {
            id: "m".to_string(),
            name: "m".to_string(),
            provider: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            context_window: 8_192,
            max_tokens: 1_024,
        };
        let message = transport_error_message(
            &model,
            AiError::new(AiErrorCode::ProviderHttp, "Chat completion HTTP 503: busy"),
        );

        let error = error_from_message(&message);
        assert_eq!(error.code, AiErrorCode::ProviderHttp);
        assert_eq!(error.message, "Chat completion HTTP 503: busy");
    }

    #[test]
    fn stream_outside_runtime_is_rejected() {
        let client = ChatClient::new("http://localhost:11434/v1");
        let model = Model {
            id: "m".to_string(),
            name: "m".to_string(),
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434/v1".to_string(),
            context_window: 8_192,
            max_tokens: 1_024,
        };
        let context = Context {
            system_prompt: None,
            messages: vec![],
            tools: None,
        };

        let error = match client.stream(model, context, None) {
            Ok(_) => panic!("streaming without a runtime must fail"),
            Err(error) => error,
        };
        assert_eq!(error.code, AiErrorCode::ProviderProtocol);
    }
}
