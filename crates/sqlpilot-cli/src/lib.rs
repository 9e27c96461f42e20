pub mod cli;
pub mod config;
mod session_store;
mod sqlite;

pub use config::{
    ConfigError, ConfigOverrides, LogConfig, RuntimeConfig, SqlpilotToml, read_toml_if_exists,
    resolve_config_value, resolve_runtime_config,
};
pub use session_store::JsonlCheckpointStore;
pub use sqlite::{DatabaseError, SqliteDatabase};
