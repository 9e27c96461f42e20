use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use sqlpilot_agent_core::{AdapterError, SqlDatabase};
use thiserror::Error;
use tracing::debug;

const SAMPLE_ROW_COUNT: usize = 3;
const SAMPLE_VALUE_MAX_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("open database {path} failed: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("table_names {names} not found in database")]
    UnknownTables { names: String },
    #[error("database worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// SQLite database exposed to the agent.
///
/// rusqlite is blocking, so every call runs on the blocking pool behind a
/// shared connection.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Opens an existing database file. A missing file is an error, not a new
    /// empty database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|source| DatabaseError::Open {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "opened sqlite database");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_connection<T, F>(&self, work: F) -> Result<T, DatabaseError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("sqlite connection mutex poisoned");
            work(&conn)
        })
        .await?
    }
}

#[async_trait]
impl SqlDatabase for SqliteDatabase {
    fn dialect(&self) -> &str {
        "SQLite"
    }

    async fn list_tables(&self) -> Result<String, AdapterError> {
        let names = self.with_connection(table_names).await?;
        Ok(names.join(", "))
    }

    async fn get_schema(&self, table_names: &str) -> Result<String, AdapterError> {
        let requested = table_names.to_string();
        Ok(self
            .with_connection(move |conn| table_info(conn, &requested))
            .await?)
    }

    async fn run_query(&self, query: &str) -> Result<String, AdapterError> {
        let query = query.to_string();
        let result = self
            .with_connection(move |conn| execute_query(conn, &query))
            .await;
        match result {
            Ok(rows) => Ok(rows),
            Err(DatabaseError::Worker(error)) => Err(Box::new(DatabaseError::Worker(error))),
            Err(error) => Ok(format!("Error: {error}")),
        }
    }
}

fn table_names(conn: &Connection) -> Result<Vec<String>, DatabaseError> {
    let mut statement = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = statement
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

fn table_info(conn: &Connection, requested: &str) -> Result<String, DatabaseError> {
    let known = table_names(conn)?;
    let requested: Vec<&str> = requested
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();

    let missing: Vec<&str> = requested
        .iter()
        .copied()
        .filter(|name| !known.iter().any(|candidate| candidate.as_str() == *name))
        .collect();
    if !missing.is_empty() {
        let names = missing
            .iter()
            .map(|name| format!("'{name}'"))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(DatabaseError::UnknownTables {
            names: format!("{{{names}}}"),
        });
    }

    let tables: Vec<&str> = if requested.is_empty() {
        known.iter().map(String::as_str).collect()
    } else {
        requested
    };

    let mut sections = Vec::with_capacity(tables.len());
    for table in tables {
        let create_sql: String = conn.query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        let samples = sample_rows(conn, table)?;
        sections.push(format!(
            "{}\n\n/*\n{SAMPLE_ROW_COUNT} rows from {table} table:\n{samples}\n*/",
            create_sql.trim()
        ));
    }
    Ok(sections.join("\n\n"))
}

fn sample_rows(conn: &Connection, table: &str) -> Result<String, DatabaseError> {
    let mut statement = conn.prepare(&format!(
        "SELECT * FROM {} LIMIT {SAMPLE_ROW_COUNT}",
        quote_identifier(table)
    ))?;
    let header = statement.column_names().join("\t");
    let column_count = statement.column_count();

    let mut lines = vec![header];
    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            let value = render_plain(row.get_ref(index)?);
            values.push(value.chars().take(SAMPLE_VALUE_MAX_CHARS).collect::<String>());
        }
        lines.push(values.join("\t"));
    }
    Ok(lines.join("\n"))
}

fn execute_query(conn: &Connection, query: &str) -> Result<String, DatabaseError> {
    let mut statement = conn.prepare(query)?;
    let column_count = statement.column_count();
    if column_count == 0 {
        statement.execute([])?;
        return Ok(String::new());
    }

    let mut rendered = Vec::new();
    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            values.push(render_literal(row.get_ref(index)?));
        }
        rendered.push(render_tuple(&values));
    }
    if rendered.is_empty() {
        return Ok(String::new());
    }
    Ok(format!("[{}]", rendered.join(", ")))
}

fn render_tuple(values: &[String]) -> String {
    if values.len() == 1 {
        format!("({},)", values[0])
    } else {
        format!("({})", values.join(", "))
    }
}

fn render_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Text(bytes) => quote_text(&String::from_utf8_lossy(bytes)),
        other => render_plain(other),
    }
}

/// Quotes text the way Python's `repr` does: single quotes unless the text
/// holds a single quote and no double quote.
fn quote_text(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            ch if ch == quote => {
                quoted.push('\\');
                quoted.push(ch);
            }
            ch => quoted.push(ch),
        }
    }
    quoted.push(quote);
    quoted
}

fn render_plain(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "None".to_string(),
        ValueRef::Integer(number) => number.to_string(),
        ValueRef::Real(number) if number.is_finite() && number.fract() == 0.0 => {
            format!("{number:.1}")
        }
        ValueRef::Real(number) => number.to_string(),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Blob(bytes) => format!("<blob {} bytes>", bytes.len()),
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
