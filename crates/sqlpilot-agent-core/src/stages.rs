use std::time::Instant;

use serde_json::{Value, json};
use sqlpilot_ai::{AssistantContentBlock, Message, StopReason, Usage};
use tracing::{debug, warn};

use crate::capability::{Capability, ToolRequest};
use crate::checkpoint::ConversationState;
use crate::database::{AdapterError, SqlDatabase};
use crate::types::{AgentMessage, now_millis};

const FORCED_MODEL: &str = "sqlpilot-forced";

/// Synthetic request that makes every turn start from the table list.
pub fn force_list_tables(state: &ConversationState) -> AgentMessage {
    forced_request(
        "List tables",
        Capability::ListTables,
        json!({}),
        state.last().map(Message::timestamp).unwrap_or_default(),
    )
}

/// Synthetic schema request for the tables named by the latest message.
///
/// The text is forwarded as-is; if it is an error observation the schema tool
/// reports that back as its own error.
pub fn force_get_schema(state: &ConversationState) -> AgentMessage {
    let (table_names, timestamp) = state
        .last()
        .map(|message| (message.text(), message.timestamp()))
        .unwrap_or_default();
    forced_request(
        "Get schema",
        Capability::GetSchema,
        json!({ "table_names": table_names }),
        timestamp,
    )
}

fn forced_request(
    text: &str,
    capability: Capability,
    arguments: Value,
    timestamp: i64,
) -> AgentMessage {
    Message::Assistant {
        content: vec![
            AssistantContentBlock::Text {
                text: text.to_string(),
            },
            AssistantContentBlock::ToolCall {
                id: capability.wire_name().to_string(),
                name: capability.wire_name().to_string(),
                arguments,
            },
        ],
        model: FORCED_MODEL.to_string(),
        usage: Usage::default(),
        stop_reason: StopReason::ToolUse,
        error_message: None,
        timestamp,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolExecution {
    pub message: AgentMessage,
    pub duration_ms: u64,
}

impl ToolExecution {
    pub fn is_error(&self) -> bool {
        matches!(self.message, Message::ToolResult { is_error: true, .. })
    }
}

/// Runs each request in order, allowing only `permitted`.
///
/// Never fails: adapter errors and disallowed names become error observations.
pub async fn execute_tool_requests(
    database: &dyn SqlDatabase,
    permitted: Capability,
    requests: &[ToolRequest],
) -> Vec<ToolExecution> {
    let mut executions = Vec::with_capacity(requests.len());
    for request in requests {
        let started_at = Instant::now();
        let content = if Capability::parse(&request.name) == Some(permitted) {
            match dispatch(database, permitted, &request.arguments).await {
                Ok(text) => text,
                Err(error) => {
                    warn!(
                        tool = request.name.as_str(),
                        tool_call_id = request.id.as_str(),
                        error = %error,
                        "tool adapter failed"
                    );
                    format!("Error: {error}\nPlease fix your mistakes.")
                }
            }
        } else {
            format!(
                "Error: {} is not a valid tool, try one of [{}].",
                request.name,
                permitted.wire_name()
            )
        };

        let duration_ms = started_at.elapsed().as_millis() as u64;
        let is_error = content.starts_with("Error:");
        debug!(
            tool = request.name.as_str(),
            tool_call_id = request.id.as_str(),
            duration_ms,
            is_error,
            "tool execution finished"
        );
        executions.push(ToolExecution {
            message: Message::ToolResult {
                tool_call_id: request.id.clone(),
                tool_name: request.name.clone(),
                content,
                is_error,
                timestamp: now_millis(),
            },
            duration_ms,
        });
    }
    executions
}

async fn dispatch(
    database: &dyn SqlDatabase,
    capability: Capability,
    arguments: &Value,
) -> Result<String, AdapterError> {
    match capability {
        Capability::ListTables => database.list_tables().await,
        Capability::GetSchema => {
            let table_names = string_argument(arguments, "table_names")?;
            database.get_schema(&table_names).await
        }
        Capability::RunQuery => {
            let query = string_argument(arguments, "query")?;
            database.run_query(&query).await
        }
        Capability::FinalResponse => Err("FinalResponse is an answer, not an executable tool".into()),
    }
}

fn string_argument(arguments: &Value, key: &str) -> Result<String, AdapterError> {
    match arguments.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(Value::Null) | None => Err(format!("missing required argument '{key}'").into()),
        Some(other) => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct EchoDatabase;

    #[async_trait]
    impl SqlDatabase for EchoDatabase {
        fn dialect(&self) -> &str {
            "SQLite"
        }

        async fn list_tables(&self) -> Result<String, AdapterError> {
            Ok("courses, students".to_string())
        }

        async fn get_schema(&self, table_names: &str) -> Result<String, AdapterError> {
            if table_names == "missing" {
                return Err("table_names {'missing'} not found in database".into());
            }
            Ok(format!("CREATE TABLE {table_names} (id INTEGER)"))
        }

        async fn run_query(&self, query: &str) -> Result<String, AdapterError> {
            Ok(format!("ran {query}"))
        }
    }

    fn request(name: &str, arguments: Value) -> ToolRequest {
        ToolRequest {
            id: format!("id-{name}"),
            name: name.to_string(),
            arguments,
        }
    }

    #[test]
    fn forced_list_tables_has_fixed_shape() {
        let mut state = ConversationState::new("s");
        state.push(Message::User {
            content: "hi".to_string(),
            timestamp: 5,
        });
        let message = force_list_tables(&state);

        assert_eq!(message.text(), "List tables");
        let calls = message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "sql_db_list_tables");
        assert_eq!(calls[0].name, "sql_db_list_tables");
        assert_eq!(calls[0].arguments, json!({}));
        assert_eq!(message.timestamp(), 5);
    }

    #[test]
    fn forced_schema_request_forwards_last_content() {
        let mut state = ConversationState::new("s");
        state.push(Message::ToolResult {
            tool_call_id: "sql_db_list_tables".to_string(),
            tool_name: "sql_db_list_tables".to_string(),
            content: "courses, students".to_string(),
            is_error: false,
            timestamp: 9,
        });

        let first = force_get_schema(&state);
        let second = force_get_schema(&state);
        assert_eq!(first, second);
        assert_eq!(first.text(), "Get schema");
        assert_eq!(
            first.tool_calls()[0].arguments,
            json!({ "table_names": "courses, students" })
        );
    }

    #[tokio::test]
    async fn adapter_errors_become_observations() {
        let executions = execute_tool_requests(
            &EchoDatabase,
            Capability::GetSchema,
            &[request("sql_db_schema", json!({ "table_names": "missing" }))],
        )
        .await;

        assert_eq!(executions.len(), 1);
        assert!(executions[0].is_error());
        assert_eq!(
            executions[0].message.text(),
            "Error: table_names {'missing'} not found in database\nPlease fix your mistakes."
        );
    }

    #[tokio::test]
    async fn disallowed_names_are_reported_without_dispatch() {
        let executions = execute_tool_requests(
            &EchoDatabase,
            Capability::RunQuery,
            &[
                request("sql_db_list_tables", json!({})),
                request("sql_db_query", json!({ "query": "SELECT 1" })),
            ],
        )
        .await;

        assert_eq!(
            executions[0].message.text(),
            "Error: sql_db_list_tables is not a valid tool, try one of [sql_db_query]."
        );
        assert!(executions[0].is_error());
        assert_eq!(executions[1].message.text(), "ran SELECT 1");
        assert!(!executions[1].is_error());
    }

    #[tokio::test]
    async fn missing_query_argument_is_an_error_observation() {
        let executions = execute_tool_requests(
            &EchoDatabase,
            Capability::RunQuery,
            &[request("sql_db_query", json!({}))],
        )
        .await;

        assert_eq!(
            executions[0].message.text(),
            "Error: missing required argument 'query'\nPlease fix your mistakes."
        );
    }
}
