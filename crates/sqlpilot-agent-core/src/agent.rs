use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sqlpilot_ai::{Message, Model, StreamOptions};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::capability::Capability;
use crate::checkpoint::{CheckpointStore, ConversationState};
use crate::database::SqlDatabase;
use crate::error::AgentError;
use crate::generation::{GenerationRequest, generate};
use crate::graph::{DEFAULT_RECURSION_LIMIT, IterationBudget, Stage};
use crate::prompt::system_prompt;
use crate::reply::{AgentReply, extract_reply};
use crate::stages::{execute_tool_requests, force_get_schema, force_list_tables};
use crate::types::{AgentEvent, AgentEventSink, AgentMessage, AgentRunMetrics, StreamFn, now_millis};

#[derive(Clone)]
pub struct AgentConfig {
    pub model: Model,
    pub stream_fn: StreamFn,
    pub database: Arc<dyn SqlDatabase>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Replaces the prompt derived from the database dialect.
    pub system_prompt: Option<String>,
    pub stream_options: StreamOptions,
    pub event_sink: Option<AgentEventSink>,
}

impl AgentConfig {
    pub fn new(
        model: Model,
        stream_fn: StreamFn,
        database: Arc<dyn SqlDatabase>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            model,
            stream_fn,
            database,
            checkpoints,
            system_prompt: None,
            stream_options: StreamOptions::default(),
            event_sink: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub session_id: String,
    pub recursion_limit: usize,
}

impl SessionConfig {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }

    pub fn with_recursion_limit(mut self, recursion_limit: usize) -> Self {
        self.recursion_limit = recursion_limit;
        self
    }
}

#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub reply: AgentReply,
    /// Messages appended to the session during this turn, user input first.
    pub messages: Vec<AgentMessage>,
    pub metrics: AgentRunMetrics,
}

/// Runs conversation turns through the SQL agent graph.
///
/// Turns on the same session are serialized; different sessions run
/// independently.
pub struct SqlAgent {
    config: AgentConfig,
    system_prompt: String,
    session_locks: SessionLocks,
}

impl SqlAgent {
    pub fn new(config: AgentConfig) -> Self {
        let system_prompt = config
            .system_prompt
            .clone()
            .unwrap_or_else(|| system_prompt(config.database.dialect()));
        Self {
            config,
            system_prompt,
            session_locks: SessionLocks::default(),
        }
    }

    pub fn history(&self, session_id: &str) -> Result<Vec<AgentMessage>, AgentError> {
        Ok(self
            .config
            .checkpoints
            .load(session_id)?
            .map(|state| state.history)
            .unwrap_or_default())
    }

    pub async fn invoke(
        &self,
        session: &SessionConfig,
        user_input: &str,
    ) -> Result<TurnOutcome, AgentError> {
        if user_input.trim().is_empty() {
            return Err(AgentError::EmptyInput);
        }

        let lock = self.session_locks.acquire(&session.session_id);
        let result = {
            let _guard = lock.lock().await;
            self.run_turn(session, user_input).await
        };
        self.session_locks.release(&session.session_id, lock);
        result
    }

    async fn run_turn(
        &self,
        session: &SessionConfig,
        user_input: &str,
    ) -> Result<TurnOutcome, AgentError> {
        let state = self
            .config
            .checkpoints
            .load(&session.session_id)?
            .unwrap_or_else(|| ConversationState::new(session.session_id.clone()));
        TurnRunner::new(self, session, state)
            .run(user_input)
            .await
    }
}

/// Per-session turn locks. An entry lives only while some turn on that
/// session is running or waiting.
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    fn acquire(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("session lock mutex poisoned");
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn release(&self, session_id: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.locks.lock().expect("session lock mutex poisoned");
        // The map and `lock` hold the only references: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(session_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().expect("session lock mutex poisoned").len()
    }
}

struct TurnRunner<'a> {
    agent: &'a SqlAgent,
    state: ConversationState,
    budget: IterationBudget,
    metrics: AgentRunMetrics,
    turn_start: usize,
}

impl<'a> TurnRunner<'a> {
    fn new(agent: &'a SqlAgent, session: &SessionConfig, state: ConversationState) -> Self {
        let turn_start = state.history.len();
        Self {
            agent,
            state,
            budget: IterationBudget::new(session.recursion_limit),
            metrics: AgentRunMetrics::default(),
            turn_start,
        }
    }

    async fn run(mut self, user_input: &str) -> Result<TurnOutcome, AgentError> {
        info!(
            session_id = self.state.session_id.as_str(),
            history = self.state.history.len(),
            recursion_limit = self.budget.limit(),
            "agent turn started"
        );
        self.emit(AgentEvent::TurnStart {
            session_id: self.state.session_id.clone(),
        });

        let result = self.run_stages(user_input).await;
        self.finish(&result);
        result
    }

    async fn run_stages(&mut self, user_input: &str) -> Result<TurnOutcome, AgentError> {
        self.append(vec![Message::User {
            content: user_input.to_string(),
            timestamp: now_millis(),
        }])?;

        let mut stage = Stage::ForceListTables;
        while stage != Stage::End {
            self.budget.consume()?;
            debug!(
                session_id = self.state.session_id.as_str(),
                stage = stage.name(),
                step = self.budget.used(),
                "running stage"
            );
            self.emit(AgentEvent::StageStart { stage });

            let appended = self.run_stage(stage).await?;
            self.metrics.stage_executions += 1;
            self.append(appended)?;
            stage = stage.next(self.state.last());
        }

        let reply = self
            .state
            .history
            .iter()
            .rev()
            .find(|message| matches!(message, Message::Assistant { .. }))
            .map(extract_reply)
            .unwrap_or_else(|| AgentReply::Text(String::new()));

        Ok(TurnOutcome {
            reply,
            messages: self.state.history[self.turn_start..].to_vec(),
            metrics: self.metrics.clone(),
        })
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<Vec<AgentMessage>, AgentError> {
        match stage {
            Stage::ForceListTables => Ok(vec![force_list_tables(&self.state)]),
            Stage::ListTablesAction => Ok(self.execute_tools(Capability::ListTables).await),
            Stage::ForceGetSchema => Ok(vec![force_get_schema(&self.state)]),
            Stage::GetSchemaAction => Ok(self.execute_tools(Capability::GetSchema).await),
            Stage::QueryGeneration => self.generate().await,
            Stage::QueryAction => Ok(self.execute_tools(Capability::RunQuery).await),
            Stage::End => Ok(vec![]),
        }
    }

    async fn execute_tools(&mut self, permitted: Capability) -> Vec<AgentMessage> {
        let requests = self
            .state
            .last()
            .map(Message::tool_calls)
            .unwrap_or_default();
        let executions =
            execute_tool_requests(self.agent.config.database.as_ref(), permitted, &requests).await;

        let mut messages = Vec::with_capacity(executions.len());
        for execution in executions {
            let is_error = execution.is_error();
            self.metrics.tool_execution_count += 1;
            self.metrics.tool_execution_total_ms += execution.duration_ms;
            if is_error {
                self.metrics.recovered_error_count += 1;
            }
            if let Message::ToolResult {
                tool_call_id,
                tool_name,
                ..
            } = &execution.message
            {
                self.emit(AgentEvent::ToolExecutionEnd {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    is_error,
                    duration_ms: execution.duration_ms,
                });
            }
            messages.push(execution.message);
        }
        messages
    }

    async fn generate(&mut self) -> Result<Vec<AgentMessage>, AgentError> {
        let config = &self.agent.config;
        let outcome = generate(
            GenerationRequest {
                stream_fn: &config.stream_fn,
                model: &config.model,
                system_prompt: &self.agent.system_prompt,
                options: &config.stream_options,
                event_sink: config.event_sink.as_ref(),
            },
            &self.state.history,
        )
        .await?;

        self.metrics.generation_count += 1;
        self.metrics.generation_total_ms += outcome.duration_ms;
        self.metrics.recovered_error_count += outcome.rejected_calls;
        Ok(outcome.messages)
    }

    fn append(&mut self, messages: Vec<AgentMessage>) -> Result<(), AgentError> {
        for message in messages {
            self.state.push(message.clone());
            self.emit(AgentEvent::MessageAppended { message });
        }
        self.agent.config.checkpoints.save(&self.state)?;
        Ok(())
    }

    fn finish(&self, result: &Result<TurnOutcome, AgentError>) {
        match result {
            Ok(_) => info!(
                session_id = self.state.session_id.as_str(),
                steps = self.budget.used(),
                "agent turn finished"
            ),
            Err(error) if error.is_timeout() => warn!(
                session_id = self.state.session_id.as_str(),
                steps = self.budget.used(),
                "agent turn stopped at recursion limit"
            ),
            Err(error) => warn!(
                session_id = self.state.session_id.as_str(),
                error = %error,
                "agent turn failed"
            ),
        }
        debug!(
            stage_executions = self.metrics.stage_executions,
            generation_count = self.metrics.generation_count,
            generation_total_ms = self.metrics.generation_total_ms,
            tool_execution_count = self.metrics.tool_execution_count,
            tool_execution_total_ms = self.metrics.tool_execution_total_ms,
            recovered_error_count = self.metrics.recovered_error_count,
            "agent run metrics"
        );
        self.emit(AgentEvent::Metrics {
            metrics: self.metrics.clone(),
        });
        self.emit(AgentEvent::TurnEnd {
            session_id: self.state.session_id.clone(),
        });
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(sink) = &self.agent.config.event_sink {
            sink(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lock_is_dropped_after_its_last_turn() {
        let locks = SessionLocks::default();
        let first = locks.acquire("s1");
        let waiting = locks.acquire("s1");
        let other = locks.acquire("s2");
        assert!(Arc::ptr_eq(&first, &waiting));
        assert_eq!(locks.len(), 2);

        locks.release("s1", first);
        assert_eq!(locks.len(), 2);
        locks.release("s1", waiting);
        locks.release("s2", other);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn released_session_can_be_locked_again() {
        let locks = SessionLocks::default();
        let first = locks.acquire("s1");
        locks.release("s1", first);

        let second = locks.acquire("s1");
        assert_eq!(locks.len(), 1);
        assert_eq!(Arc::strong_count(&second), 2);
        assert!(second.try_lock().is_ok());
    }
}
