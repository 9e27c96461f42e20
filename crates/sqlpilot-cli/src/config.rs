use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sqlpilot_agent_core::DEFAULT_RECURSION_LIMIT;
use sqlpilot_ai::{DEFAULT_TRANSPORT_RETRY_COUNT, Model};
use thiserror::Error;

pub const DEFAULT_HOME_DIR_NAME: &str = ".sqlpilot";
pub const CONFIG_FILE_NAME: &str = "sqlpilot.toml";
const DEFAULT_PROVIDER: &str = "ollama";
const DEFAULT_MODEL: &str = "llama3.1";
const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";
const DEFAULT_CONTEXT_WINDOW: u32 = 128_000;
const DEFAULT_MAX_TOKENS: u32 = 4_096;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path} failed: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path} failed: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("no database configured; set [database].path in sqlpilot.toml or pass --db")]
    MissingDatabase,
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Contents of `sqlpilot.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SqlpilotToml {
    #[serde(default)]
    pub llm: LlmToml,
    #[serde(default)]
    pub database: DatabaseToml,
    #[serde(default)]
    pub agent: AgentToml,
    #[serde(default)]
    pub log: LogToml,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmToml {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub transport_retry_count: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseToml {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentToml {
    #[serde(default)]
    pub recursion_limit: Option<usize>,
    #[serde(default)]
    pub session_dir: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogToml {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub stdout: Option<bool>,
}

/// Command line values that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub database_path: Option<PathBuf>,
    pub recursion_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub level: String,
    pub stdout: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub model: Model,
    pub api_key: Option<String>,
    pub temperature: f64,
    pub transport_retry_count: usize,
    pub database_path: PathBuf,
    pub session_dir: PathBuf,
    pub recursion_limit: usize,
    pub system_prompt: Option<String>,
    pub log: LogConfig,
}

pub fn read_toml_if_exists<T>(path: &Path) -> Result<Option<T>, ConfigError>
where
    T: for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let parsed = toml::from_str::<T>(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Some(parsed))
}

/// Merges file values, command line overrides and defaults.
///
/// Paths read from the file expand a leading `~`; `--db` is taken as given.
pub fn resolve_runtime_config(
    file: &SqlpilotToml,
    overrides: &ConfigOverrides,
    home_dir: &Path,
) -> Result<RuntimeConfig, ConfigError> {
    let env_map = &file.env;
    let llm = &file.llm;

    let provider = configured(llm.provider.as_deref(), env_map)
        .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
    let model_id = first_non_empty([
        overrides.model.clone(),
        configured(llm.model.as_deref(), env_map),
    ])
    .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let base_url = first_non_empty([
        overrides.base_url.clone(),
        configured(llm.base_url.as_deref(), env_map),
    ])
    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let max_tokens = llm.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    let context_window = llm.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW);

    let temperature = llm.temperature.unwrap_or(0.0);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ConfigError::Invalid {
            field: "llm.temperature",
            reason: format!("{temperature} is outside 0.0..=2.0"),
        });
    }

    let recursion_limit = overrides
        .recursion_limit
        .or(file.agent.recursion_limit)
        .unwrap_or(DEFAULT_RECURSION_LIMIT);
    if recursion_limit == 0 {
        return Err(ConfigError::Invalid {
            field: "recursion_limit",
            reason: "must be at least 1".to_string(),
        });
    }

    let database_path = overrides
        .database_path
        .clone()
        .or_else(|| {
            configured(file.database.path.as_deref(), env_map)
                .map(|value| expand_home_path(&value, home_dir))
        })
        .ok_or(ConfigError::MissingDatabase)?;

    let session_dir = configured(file.agent.session_dir.as_deref(), env_map)
        .map(|value| expand_home_path(&value, home_dir))
        .unwrap_or_else(|| home_dir.join("sessions"));
    let system_prompt = configured(file.agent.system_prompt.as_deref(), env_map);

    Ok(RuntimeConfig {
        model: Model {
            id: model_id.clone(),
            name: model_id,
            provider,
            base_url,
            context_window,
            max_tokens,
        },
        api_key: configured(llm.api_key.as_deref(), env_map),
        temperature,
        transport_retry_count: llm
            .transport_retry_count
            .unwrap_or(DEFAULT_TRANSPORT_RETRY_COUNT),
        database_path,
        session_dir,
        recursion_limit,
        system_prompt,
        log: resolve_log_config(&file.log, env_map, home_dir),
    })
}

fn resolve_log_config(log: &LogToml, env_map: &HashMap<String, String>, home_dir: &Path) -> LogConfig {
    let dir = configured(log.path.as_deref(), env_map)
        .map(|value| expand_home_path(&value, home_dir))
        .unwrap_or_else(|| home_dir.join("logs"));
    let level = configured(log.level.as_deref(), env_map)
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    LogConfig {
        dir,
        level,
        stdout: log.stdout.unwrap_or(false),
    }
}

fn configured(value: Option<&str>, env_map: &HashMap<String, String>) -> Option<String> {
    value.and_then(|value| resolve_config_value(value, env_map))
}

/// Resolves `$NAME` from the `[env]` table first, then the process
/// environment. Blank values count as unset.
pub fn resolve_config_value(value: &str, env_map: &HashMap<String, String>) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(env_key) = trimmed.strip_prefix('$') {
        return env_map
            .get(env_key)
            .cloned()
            .or_else(|| std::env::var(env_key).ok())
            .map(|resolved| resolved.trim().to_string())
            .filter(|resolved| !resolved.is_empty());
    }
    Some(trimmed.to_string())
}

fn first_non_empty<const N: usize>(candidates: [Option<String>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

pub fn expand_home_path(path: &str, fallback: &Path) -> PathBuf {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return fallback.to_path_buf();
    }
    if trimmed == "~" {
        return home_dir();
    }
    if let Some(suffix) = trimmed.strip_prefix("~/") {
        return home_dir().join(suffix);
    }
    PathBuf::from(trimmed)
}

pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_sqlpilot_home_dir() -> PathBuf {
    home_dir().join(DEFAULT_HOME_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> SqlpilotToml {
        toml::from_str(content).expect("valid toml")
    }

    #[test]
    fn defaults_target_local_ollama() {
        let file = parse("[database]\npath = \"school.db\"\n");
        let home = PathBuf::from("/tmp/sqlpilot-home");
        let config =
            resolve_runtime_config(&file, &ConfigOverrides::default(), &home).expect("config");

        assert_eq!(config.model.id, "llama3.1");
        assert_eq!(config.model.provider, "ollama");
        assert_eq!(config.model.base_url, "http://localhost:11434/v1");
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.recursion_limit, DEFAULT_RECURSION_LIMIT);
        assert_eq!(config.transport_retry_count, DEFAULT_TRANSPORT_RETRY_COUNT);
        assert_eq!(config.database_path, PathBuf::from("school.db"));
        assert_eq!(config.session_dir, home.join("sessions"));
        assert_eq!(config.log.dir, home.join("logs"));
        assert_eq!(config.log.level, "info");
        assert!(!config.log.stdout);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn overrides_win_and_env_table_resolves_variables() {
        let file = parse(
            r#"
[llm]
model = "qwen2.5"
base_url = "https://llm.example.com/v1"
api_key = "$SQLPILOT_TEST_KEY"
temperature = 0.2

[database]
path = "from-file.db"

[agent]
recursion_limit = 40
system_prompt = "Answer tersely."

[log]
level = "$SQLPILOT_TEST_LEVEL"
stdout = true

[env]
SQLPILOT_TEST_KEY = "secret"
SQLPILOT_TEST_LEVEL = "debug"
"#,
        );
        let overrides = ConfigOverrides {
            model: Some("llama3.1:70b".to_string()),
            base_url: None,
            database_path: Some(PathBuf::from("override.db")),
            recursion_limit: Some(12),
        };
        let config =
            resolve_runtime_config(&file, &overrides, Path::new("/tmp/h")).expect("config");

        assert_eq!(config.model.id, "llama3.1:70b");
        assert_eq!(config.model.base_url, "https://llm.example.com/v1");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.database_path, PathBuf::from("override.db"));
        assert_eq!(config.recursion_limit, 12);
        assert_eq!(config.system_prompt.as_deref(), Some("Answer tersely."));
        assert_eq!(config.log.level, "debug");
        assert!(config.log.stdout);
    }

    #[test]
    fn missing_database_is_reported() {
        let error = resolve_runtime_config(
            &SqlpilotToml::default(),
            &ConfigOverrides::default(),
            Path::new("/tmp/h"),
        )
        .expect_err("database is required");
        assert!(matches!(error, ConfigError::MissingDatabase));
    }

    #[test]
    fn zero_recursion_limit_is_rejected() {
        let overrides = ConfigOverrides {
            database_path: Some(PathBuf::from("school.db")),
            recursion_limit: Some(0),
            ..ConfigOverrides::default()
        };
        let error =
            resolve_runtime_config(&SqlpilotToml::default(), &overrides, Path::new("/tmp/h"))
                .expect_err("zero limit");
        assert!(matches!(
            error,
            ConfigError::Invalid {
                field: "recursion_limit",
                ..
            }
        ));
    }

    #[test]
    fn unset_variables_resolve_to_none() {
        let env_map = HashMap::new();
        assert_eq!(
            resolve_config_value("$SQLPILOT_SURELY_UNSET_VARIABLE", &env_map),
            None
        );
        assert_eq!(resolve_config_value("  ", &env_map), None);
        assert_eq!(
            resolve_config_value(" plain ", &env_map),
            Some("plain".to_string())
        );
    }

    #[test]
    fn config_file_is_optional_but_must_parse() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert!(read_toml_if_exists::<SqlpilotToml>(&path)
            .expect("absent file")
            .is_none());

        std::fs::write(&path, "[agent]\nrecursion_limit = \"many\"\n").expect("write config");
        let error = read_toml_if_exists::<SqlpilotToml>(&path).expect_err("type mismatch");
        assert!(matches!(error, ConfigError::Parse { .. }));
    }
}
