use async_trait::async_trait;

pub type AdapterError = Box<dyn std::error::Error + Send + Sync>;

/// Database operations the agent exposes to the model as tools.
///
/// `run_query` reports SQL failures in-band as text starting with `"Error:"`;
/// an `Err` from any method means the adapter itself failed.
#[async_trait]
pub trait SqlDatabase: Send + Sync {
    /// Human readable dialect name, used in the system prompt.
    fn dialect(&self) -> &str;

    async fn list_tables(&self) -> Result<String, AdapterError>;

    async fn get_schema(&self, table_names: &str) -> Result<String, AdapterError>;

    async fn run_query(&self, query: &str) -> Result<String, AdapterError>;
}
