use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use clap::Parser;
use sqlpilot_agent_core::{
    AgentConfig, AgentEvent, AgentEventSink, AgentMessage, CheckpointStore, MemoryCheckpointStore,
    SessionConfig, SqlAgent, StreamFn,
};
use sqlpilot_ai::{
    AssistantContentBlock, ChatClient, Context, Message, Model, StopReason, StreamOptions,
};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{
    CONFIG_FILE_NAME, ConfigOverrides, LogConfig, RuntimeConfig, SqlpilotToml,
    default_sqlpilot_home_dir, expand_home_path, read_toml_if_exists, resolve_runtime_config,
};
use crate::session_store::JsonlCheckpointStore;
use crate::sqlite::SqliteDatabase;

const LOG_FILE_NAME: &str = "sqlpilot.log";
const MESSAGE_TITLE_WIDTH: usize = 80;

#[derive(Parser, Debug)]
#[command(name = "sqlpilot", version, about = "Ask questions about a SQL database in plain language")]
pub struct Cli {
    #[arg(long)]
    conf_dir: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    recursion_limit: Option<usize>,
    /// Answer one question and exit instead of starting the prompt loop.
    #[arg(long)]
    prompt: Option<String>,
    /// Keep session history in memory only.
    #[arg(long, default_value_t = false)]
    memory: bool,
}

pub async fn run_cli_process() -> Result<(), String> {
    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<(), String> {
    let home_dir = resolve_home_dir(cli.conf_dir.as_deref());
    let file = read_toml_if_exists::<SqlpilotToml>(&home_dir.join(CONFIG_FILE_NAME))
        .map_err(|error| error.to_string())?
        .unwrap_or_default();
    let runtime = resolve_runtime_config(&file, &cli.overrides(), &home_dir)
        .map_err(|error| error.to_string())?;
    init_tracing(&runtime.log);

    let agent = build_agent(&runtime, cli.memory)?;
    let session_id = cli.session_id.clone().unwrap_or_else(generate_session_id);
    let session = SessionConfig::new(session_id).with_recursion_limit(runtime.recursion_limit);
    info!(
        session_id = session.session_id.as_str(),
        model = runtime.model.id.as_str(),
        database = %runtime.database_path.display(),
        "sqlpilot started"
    );

    if let Some(prompt) = cli.prompt.as_deref() {
        return run_turn(&agent, &session, prompt).await;
    }

    println!("session: {}", session.session_id);
    repl_loop(&agent, &session).await
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            database_path: self.db.clone(),
            recursion_limit: self.recursion_limit,
        }
    }
}

fn build_agent(runtime: &RuntimeConfig, in_memory: bool) -> Result<SqlAgent, String> {
    let database = SqliteDatabase::open(&runtime.database_path).map_err(|error| error.to_string())?;
    let checkpoints: Arc<dyn CheckpointStore> = if in_memory {
        Arc::new(MemoryCheckpointStore::new())
    } else {
        Arc::new(JsonlCheckpointStore::new(&runtime.session_dir).map_err(|error| error.to_string())?)
    };

    let client = ChatClient::new(&runtime.model.base_url);
    let stream_fn: StreamFn = Arc::new(
        move |model: Model, context: Context, options: Option<StreamOptions>| {
            client.stream(model, context, options)
        },
    );

    let mut config = AgentConfig::new(
        runtime.model.clone(),
        stream_fn,
        Arc::new(database),
        checkpoints,
    );
    config.system_prompt = runtime.system_prompt.clone();
    config.stream_options = StreamOptions {
        temperature: Some(runtime.temperature),
        api_key: runtime.api_key.clone(),
        transport_retry_count: Some(runtime.transport_retry_count),
        ..StreamOptions::default()
    };
    config.event_sink = Some(print_appended_messages());
    Ok(SqlAgent::new(config))
}

fn print_appended_messages() -> AgentEventSink {
    Arc::new(|event: AgentEvent| {
        if let AgentEvent::MessageAppended { message } = event {
            let mut stdout = io::stdout();
            if let Err(error) = render_message_to_writer(&message, &mut stdout) {
                eprintln!("warning: failed to render message: {error}");
            }
        }
    })
}

async fn repl_loop(agent: &SqlAgent, session: &SessionConfig) -> Result<(), String> {
    loop {
        print!("\nPrompt> ");
        io::stdout()
            .flush()
            .map_err(|error| format!("stdout flush failed: {error}"))?;

        let mut line = String::new();
        let read = io::stdin()
            .read_line(&mut line)
            .map_err(|error| format!("stdin read failed: {error}"))?;
        if read == 0 {
            println!();
            return Ok(());
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if is_quit_command(input) {
            println!("\nExiting SQL Bot.");
            return Ok(());
        }

        run_turn(agent, session, input).await?;
    }
}

async fn run_turn(agent: &SqlAgent, session: &SessionConfig, input: &str) -> Result<(), String> {
    println!("\nSQL Bot Response>\n");
    match agent.invoke(session, input).await {
        Ok(outcome) => {
            println!("\n{}", outcome.reply);
            Ok(())
        }
        Err(error) if error.is_timeout() => {
            println!("\nNOTICE: Agent time out.");
            Ok(())
        }
        Err(error) => Err(error.to_string()),
    }
}

fn is_quit_command(input: &str) -> bool {
    input.trim().eq_ignore_ascii_case("\\q")
}

fn render_message_to_writer<W: Write>(message: &AgentMessage, writer: &mut W) -> io::Result<()> {
    match message {
        Message::User { content, .. } => {
            writeln!(writer, "{}\n", message_title("Human Message"))?;
            writeln!(writer, "{content}")?;
        }
        Message::Assistant {
            content,
            stop_reason,
            error_message,
            ..
        } => {
            writeln!(writer, "{}\n", message_title("Ai Message"))?;
            let mut tool_calls = Vec::new();
            for block in content {
                match block {
                    AssistantContentBlock::Text { text } => {
                        if !text.trim().is_empty() {
                            writeln!(writer, "{text}")?;
                        }
                    }
                    AssistantContentBlock::ToolCall {
                        id,
                        name,
                        arguments,
                    } => tool_calls.push((id, name, arguments)),
                }
            }
            if !tool_calls.is_empty() {
                writeln!(writer, "Tool Calls:")?;
                for (id, name, arguments) in tool_calls {
                    writeln!(writer, "  {name} ({id})")?;
                    writeln!(writer, " Call ID: {id}")?;
                    writeln!(writer, "  Args:")?;
                    match arguments.as_object() {
                        Some(fields) => {
                            for (key, value) in fields {
                                match value.as_str() {
                                    Some(text) => writeln!(writer, "    {key}: {text}")?,
                                    None => writeln!(writer, "    {key}: {value}")?,
                                }
                            }
                        }
                        None => writeln!(writer, "    {arguments}")?,
                    }
                }
            }
            if matches!(stop_reason, StopReason::Error | StopReason::Aborted) {
                if let Some(error_message) = error_message {
                    writeln!(writer, "[assistant_error] {error_message}")?;
                }
            }
        }
        Message::ToolResult {
            tool_name, content, ..
        } => {
            writeln!(writer, "{}", message_title("Tool Message"))?;
            writeln!(writer, "Name: {tool_name}\n")?;
            writeln!(writer, "{content}")?;
        }
    }
    Ok(())
}

fn message_title(label: &str) -> String {
    let label = format!(" {label} ");
    let padding = MESSAGE_TITLE_WIDTH.saturating_sub(label.len());
    let left = padding / 2;
    format!("{}{label}{}", "=".repeat(left), "=".repeat(padding - left))
}

fn generate_session_id() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}

fn resolve_home_dir(conf_dir: Option<&Path>) -> PathBuf {
    let Some(conf_dir) = conf_dir else {
        return default_sqlpilot_home_dir();
    };
    let expanded = expand_home_path(&conf_dir.to_string_lossy(), &default_sqlpilot_home_dir());
    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    }
}

fn init_tracing(config: &LogConfig) {
    static TRACE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    if let Err(error) = std::fs::create_dir_all(&config.dir) {
        eprintln!(
            "warning: failed to create log directory {}: {error}",
            config.dir.display()
        );
        return;
    }
    let file_writer = tracing_appender::rolling::never(&config.dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_writer);
    let _ = TRACE_GUARD.set(guard);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);
    let mut stdout_layer = tracing_subscriber::fmt::layer();
    stdout_layer.set_ansi(false);

    let init_result = if config.stdout {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stdout_layer)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
    };
    if let Err(error) = init_result {
        eprintln!(
            "warning: failed to initialize tracing subscriber for {}: {error}",
            config.dir.join(LOG_FILE_NAME).display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlpilot_ai::Usage;

    fn render(message: &AgentMessage) -> String {
        let mut buffer = Vec::new();
        render_message_to_writer(message, &mut buffer).expect("render");
        String::from_utf8(buffer).expect("utf8")
    }

    #[test]
    fn parses_overrides_from_flags() {
        let cli = Cli::try_parse_from([
            "sqlpilot",
            "--db",
            "school.db",
            "--model",
            "qwen2.5",
            "--session-id",
            "demo",
            "--recursion-limit",
            "10",
            "--memory",
        ])
        .expect("valid flags");

        assert!(cli.memory);
        assert_eq!(cli.session_id.as_deref(), Some("demo"));
        let overrides = cli.overrides();
        assert_eq!(overrides.database_path, Some(PathBuf::from("school.db")));
        assert_eq!(overrides.model.as_deref(), Some("qwen2.5"));
        assert_eq!(overrides.recursion_limit, Some(10));
        assert!(overrides.base_url.is_none());
    }

    #[test]
    fn rejects_non_numeric_recursion_limit() {
        assert!(Cli::try_parse_from(["sqlpilot", "--recursion-limit", "lots"]).is_err());
    }

    #[test]
    fn quit_command_is_case_insensitive() {
        assert!(is_quit_command("\\q"));
        assert!(is_quit_command("  \\Q \n"));
        assert!(!is_quit_command("q"));
        assert!(!is_quit_command("\\quit"));
    }

    #[test]
    fn titles_are_centered_to_a_fixed_width() {
        let title = message_title("Tool Message");
        assert_eq!(title.len(), MESSAGE_TITLE_WIDTH);
        assert!(title.starts_with("=="));
        assert!(title.contains(" Tool Message "));
    }

    #[test]
    fn assistant_tool_calls_are_listed_with_arguments() {
        let rendered = render(&Message::Assistant {
            content: vec![AssistantContentBlock::ToolCall {
                id: "call_0".to_string(),
                name: "sql_db_query".to_string(),
                arguments: json!({ "query": "SELECT COUNT(*) FROM students" }),
            }],
            model: "llama3.1".to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::ToolUse,
            error_message: None,
            timestamp: 0,
        });

        assert!(rendered.contains(" Ai Message "));
        assert!(rendered.contains("Tool Calls:\n  sql_db_query (call_0)\n"));
        assert!(rendered.contains("    query: SELECT COUNT(*) FROM students\n"));
    }

    #[test]
    fn tool_results_show_name_and_content() {
        let rendered = render(&Message::ToolResult {
            tool_call_id: "sql_db_list_tables".to_string(),
            tool_name: "sql_db_list_tables".to_string(),
            content: "courses, students".to_string(),
            is_error: false,
            timestamp: 0,
        });
        assert!(rendered.contains("Name: sql_db_list_tables\n\ncourses, students\n"));
    }

    #[test]
    fn relative_conf_dir_resolves_against_cwd() {
        let resolved = resolve_home_dir(Some(Path::new("conf")));
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("conf"));
    }
}
