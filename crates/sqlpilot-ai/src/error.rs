use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiErrorCode {
    ToolArgumentsInvalid,
    SchemaInvalid,
    ProviderAuthMissing,
    ProviderHttp,
    ProviderTransport,
    ProviderProtocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiError {
    pub code: AiErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AiError {
    pub fn new(code: AiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Transport failures are the only ones worth repeating the request for.
    pub fn is_transport(&self) -> bool {
        self.code == AiErrorCode::ProviderTransport
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"provider_protocol\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }

    pub fn from_compact_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

impl Display for AiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for AiError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compact_json_round_trips_code_and_details() {
        let error = AiError::new(AiErrorCode::ProviderHttp, "HTTP 500: boom")
            .with_details(json!({ "status": 500 }));

        let raw = error.as_compact_json();
        assert!(raw.contains("\"provider_http\""));
        let parsed = AiError::from_compact_json(&raw).expect("compact json should parse");
        assert_eq!(parsed, error);
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(AiError::new(AiErrorCode::ProviderTransport, "reset").is_transport());
        assert!(!AiError::new(AiErrorCode::ProviderHttp, "HTTP 401").is_transport());
    }
}
