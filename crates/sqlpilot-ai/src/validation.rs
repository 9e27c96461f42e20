use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AiError, AiErrorCode};
use crate::types::Tool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Checks `tool_call.arguments` against the JSON schema of `tool`.
pub fn validate_tool_arguments(tool: &Tool, tool_call: &ToolCall) -> Result<Value, AiError> {
    let compiled = JSONSchema::compile(&tool.parameters).map_err(|error| {
        AiError::new(
            AiErrorCode::SchemaInvalid,
            format!("Invalid JSON schema for tool '{}': {error}", tool.name),
        )
        .with_details(json!({ "toolName": tool.name }))
    })?;

    if let Err(errors) = compiled.validate(&tool_call.arguments) {
        let messages = errors
            .map(|error| {
                let path = error.instance_path.to_string();
                if path.is_empty() {
                    error.to_string()
                } else {
                    format!("{path}: {error}")
                }
            })
            .collect::<Vec<_>>();

        return Err(AiError::new(
            AiErrorCode::ToolArgumentsInvalid,
            format!(
                "Validation failed for tool '{}': {}",
                tool.name,
                messages.join("; ")
            ),
        )
        .with_details(json!({
            "toolName": tool.name,
            "toolCallId": tool_call.id,
            "arguments": tool_call.arguments,
            "validationErrors": messages,
        })));
    }

    Ok(tool_call.arguments.clone())
}
