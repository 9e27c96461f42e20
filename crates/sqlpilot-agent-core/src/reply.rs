use std::fmt::{Display, Formatter};

use serde_json::Value;

use crate::capability::FinalAnswer;
use crate::types::AgentMessage;

/// What a finished turn hands back to the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentReply {
    FinalAnswer(FinalAnswer),
    Text(String),
    Raw(Value),
}

/// Reads the reply out of the message a turn ended on.
///
/// Text wins over tool calls; either is decoded as a final answer when it has
/// that shape.
pub fn extract_reply(message: &AgentMessage) -> AgentReply {
    let text = message.text();
    if !text.trim().is_empty() {
        return match serde_json::from_str::<FinalAnswer>(&text) {
            Ok(answer) => AgentReply::FinalAnswer(answer),
            Err(_) => AgentReply::Text(text),
        };
    }

    match message.tool_calls().into_iter().next() {
        Some(call) => match FinalAnswer::from_value(&call.arguments) {
            Some(answer) => AgentReply::FinalAnswer(answer),
            None => AgentReply::Raw(call.arguments),
        },
        None => AgentReply::Text(String::new()),
    }
}

impl Display for AgentReply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentReply::FinalAnswer(answer) => write!(
                f,
                "SQL Queries: {}\nFinal answer: {}\nReasoning: {}",
                answer.sql_query, answer.final_answer, answer.reasoning
            ),
            AgentReply::Text(text) => f.write_str(text),
            AgentReply::Raw(value) => write!(f, "{value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlpilot_ai::{AssistantContentBlock, Message, StopReason, Usage};

    fn assistant(content: Vec<AssistantContentBlock>) -> AgentMessage {
        Message::Assistant {
            content,
            model: "m".to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp: 0,
        }
    }

    fn final_response_call(arguments: Value) -> AssistantContentBlock {
        AssistantContentBlock::ToolCall {
            id: "call-1".to_string(),
            name: "FinalResponse".to_string(),
            arguments,
        }
    }

    #[test]
    fn tool_call_arguments_decode_into_final_answer() {
        let reply = extract_reply(&assistant(vec![final_response_call(json!({
            "final_answer": "There are 3 students.",
            "reasoning": "Counted rows.",
            "sql_query": "SELECT COUNT(*) FROM students;"
        }))]));

        assert_eq!(
            reply,
            AgentReply::FinalAnswer(FinalAnswer {
                final_answer: "There are 3 students.".to_string(),
                reasoning: "Counted rows.".to_string(),
                sql_query: "SELECT COUNT(*) FROM students;".to_string(),
            })
        );
        assert!(reply.to_string().contains("Final answer: There are 3 students."));
    }

    #[test]
    fn non_empty_text_takes_precedence() {
        let reply = extract_reply(&assistant(vec![
            AssistantContentBlock::Text {
                text: "plain words".to_string(),
            },
            final_response_call(json!({ "final_answer": "ignored" })),
        ]));
        assert_eq!(reply, AgentReply::Text("plain words".to_string()));
    }

    #[test]
    fn undecodable_arguments_are_returned_raw() {
        let reply = extract_reply(&assistant(vec![final_response_call(json!({ "answer": 1 }))]));
        assert_eq!(reply, AgentReply::Raw(json!({ "answer": 1 })));
    }
}
