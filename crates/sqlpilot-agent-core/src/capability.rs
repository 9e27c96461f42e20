use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlpilot_ai::Tool;

pub type ToolRequest = sqlpilot_ai::ToolCall;

/// The closed set of actions the agent knows how to dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    ListTables,
    GetSchema,
    RunQuery,
    FinalResponse,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::ListTables,
        Capability::GetSchema,
        Capability::RunQuery,
        Capability::FinalResponse,
    ];

    pub fn wire_name(self) -> &'static str {
        match self {
            Capability::ListTables => "sql_db_list_tables",
            Capability::GetSchema => "sql_db_schema",
            Capability::RunQuery => "sql_db_query",
            Capability::FinalResponse => "FinalResponse",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|capability| capability.wire_name() == name)
    }

    pub fn to_tool(self) -> Tool {
        let (description, parameters) = match self {
            Capability::ListTables => (
                "Input is an empty string, output is a comma-separated list of tables in the database.",
                json!({ "type": "object", "properties": {} }),
            ),
            Capability::GetSchema => (
                "Input to this tool is a comma-separated list of tables, output is the schema and sample rows for those tables.",
                json!({
                    "type": "object",
                    "properties": {
                        "table_names": {
                            "type": "string",
                            "description": "A comma-separated list of the table names for which to return the schema."
                        }
                    },
                    "required": ["table_names"]
                }),
            ),
            Capability::RunQuery => (
                "Executes a SQL query against the database and returns the result. Results with errors have the prefix \"Error:\".",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "The SQL query to execute."
                        }
                    },
                    "required": ["query"]
                }),
            ),
            Capability::FinalResponse => (
                "Final response to the user",
                json!({
                    "type": "object",
                    "properties": {
                        "final_answer": {
                            "type": "string",
                            "description": "A full, accurate and descriptive response."
                        },
                        "reasoning": {
                            "type": "string",
                            "description": "Steps to get to the final answer."
                        },
                        "sql_query": {
                            "type": "string",
                            "description": "SQL queries used to get to the final answer."
                        }
                    },
                    "required": ["final_answer", "reasoning", "sql_query"]
                }),
            ),
        };

        Tool {
            name: self.wire_name().to_string(),
            description: description.to_string(),
            parameters,
        }
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Tools offered to the model during query generation.
pub fn generation_tools() -> Vec<Tool> {
    vec![
        Capability::RunQuery.to_tool(),
        Capability::FinalResponse.to_tool(),
    ]
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub final_answer: String,
    pub reasoning: String,
    pub sql_query: String,
}

impl FinalAnswer {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_parse_back_to_capabilities() {
        for capability in Capability::ALL {
            assert_eq!(Capability::parse(capability.wire_name()), Some(capability));
        }
        assert_eq!(Capability::parse("sql_db_drop"), None);
        assert_eq!(Capability::parse("finalresponse"), None);
    }

    #[test]
    fn generation_offers_only_query_and_final_response() {
        let names = generation_tools()
            .into_iter()
            .map(|tool| tool.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["sql_db_query", "FinalResponse"]);
    }

    #[test]
    fn final_answer_requires_all_fields() {
        assert!(FinalAnswer::from_value(&json!({ "final_answer": "42" })).is_none());
        let answer = FinalAnswer::from_value(&json!({
            "final_answer": "42",
            "reasoning": "counted",
            "sql_query": "SELECT 42"
        }))
        .expect("complete answer");
        assert_eq!(answer.sql_query, "SELECT 42");
    }
}
