use std::fmt::{Display, Formatter};

use sqlpilot_ai::Message;

use crate::capability::Capability;
use crate::error::AgentError;

pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Nodes of the agent's control graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    ForceListTables,
    ListTablesAction,
    ForceGetSchema,
    GetSchemaAction,
    QueryGeneration,
    QueryAction,
    End,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::ForceListTables => "force_list_tables",
            Stage::ListTablesAction => "list_tables_action",
            Stage::ForceGetSchema => "force_get_schema",
            Stage::GetSchemaAction => "get_schema_action",
            Stage::QueryGeneration => "query_gen_agent",
            Stage::QueryAction => "sql_db_query_action",
            Stage::End => "end",
        }
    }

    /// The stage that runs after `self`, given the newest history entry.
    pub fn next(self, last: Option<&Message>) -> Stage {
        match self {
            Stage::ForceListTables => Stage::ListTablesAction,
            Stage::ListTablesAction => Stage::ForceGetSchema,
            Stage::ForceGetSchema => Stage::GetSchemaAction,
            Stage::GetSchemaAction => Stage::QueryGeneration,
            Stage::QueryGeneration => match route(last) {
                RoutingDecision::RetryGeneration => Stage::QueryGeneration,
                RoutingDecision::ExecuteQuery => Stage::QueryAction,
                RoutingDecision::Terminate => Stage::End,
            },
            Stage::QueryAction => Stage::QueryGeneration,
            Stage::End => Stage::End,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingDecision {
    RetryGeneration,
    ExecuteQuery,
    Terminate,
}

/// Decides what follows a generation step. Only the first tool call counts.
pub fn route(last: Option<&Message>) -> RoutingDecision {
    match last {
        Some(Message::ToolResult { content, .. }) if content.starts_with("Error:") => {
            RoutingDecision::RetryGeneration
        }
        Some(message @ Message::Assistant { .. }) => {
            let first_call = message.tool_calls().into_iter().next();
            match first_call.and_then(|call| Capability::parse(&call.name)) {
                Some(Capability::RunQuery) => RoutingDecision::ExecuteQuery,
                _ => RoutingDecision::Terminate,
            }
        }
        _ => RoutingDecision::Terminate,
    }
}

/// Counts stage executions within one turn.
#[derive(Clone, Debug)]
pub struct IterationBudget {
    limit: usize,
    used: usize,
}

impl IterationBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Claims one step, failing once `limit` steps have already run.
    pub fn consume(&mut self) -> Result<(), AgentError> {
        if self.used >= self.limit {
            return Err(AgentError::RecursionLimit { limit: self.limit });
        }
        self.used += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlpilot_ai::{AssistantContentBlock, StopReason, Usage};

    fn assistant_calls(names: &[&str]) -> Message {
        Message::Assistant {
            content: names
                .iter()
                .map(|name| AssistantContentBlock::ToolCall {
                    id: format!("call-{name}"),
                    name: name.to_string(),
                    arguments: json!({}),
                })
                .collect(),
            model: "m".to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            timestamp: 0,
        }
    }

    fn tool_result(content: &str) -> Message {
        Message::ToolResult {
            tool_call_id: "call".to_string(),
            tool_name: "sql_db_query".to_string(),
            content: content.to_string(),
            is_error: content.starts_with("Error:"),
            timestamp: 0,
        }
    }

    #[test]
    fn routing_inspects_only_first_tool_call() {
        assert_eq!(
            route(Some(&assistant_calls(&["sql_db_query", "FinalResponse"]))),
            RoutingDecision::ExecuteQuery
        );
        assert_eq!(
            route(Some(&assistant_calls(&["FinalResponse", "sql_db_query"]))),
            RoutingDecision::Terminate
        );
        assert_eq!(route(Some(&assistant_calls(&[]))), RoutingDecision::Terminate);
    }

    #[test]
    fn error_observation_routes_back_to_generation() {
        assert_eq!(
            route(Some(&tool_result("Error: The wrong tool was called: x. Please fix your mistakes."))),
            RoutingDecision::RetryGeneration
        );
        assert_eq!(route(Some(&tool_result("[(1,)]"))), RoutingDecision::Terminate);
        assert_eq!(route(None), RoutingDecision::Terminate);
    }

    #[test]
    fn fixed_edges_follow_the_bootstrap_sequence() {
        let mut stage = Stage::ForceListTables;
        let mut visited = vec![stage];
        while stage != Stage::QueryGeneration {
            stage = stage.next(None);
            visited.push(stage);
        }
        assert_eq!(
            visited,
            vec![
                Stage::ForceListTables,
                Stage::ListTablesAction,
                Stage::ForceGetSchema,
                Stage::GetSchemaAction,
                Stage::QueryGeneration,
            ]
        );
        assert_eq!(Stage::QueryAction.next(None), Stage::QueryGeneration);
        assert_eq!(
            Stage::QueryGeneration.next(Some(&assistant_calls(&["sql_db_query"]))),
            Stage::QueryAction
        );
    }

    #[test]
    fn budget_allows_exactly_limit_steps() {
        let mut budget = IterationBudget::new(3);
        for _ in 0..3 {
            budget.consume().expect("within budget");
        }
        let error = budget.consume().expect_err("budget exhausted");
        assert!(matches!(error, AgentError::RecursionLimit { limit: 3 }));
        assert_eq!(budget.used(), 3);
    }
}
