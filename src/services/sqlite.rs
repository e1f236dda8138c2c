//! SQL execution against a SQLite analytics store

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::engine::state::{read_resource, write_resource, DatasetRef, PREVIEW_ROWS};
use crate::error::{FlowError, FlowResult};
use crate::services::{ArtifactPaths, DataExtractor};

/// Tabular snapshot persisted for the plotting stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSnapshot {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
}

impl DatasetSnapshot {
    pub fn save(&self, path: &Path) -> FlowResult<()> {
        write_resource(path, &serde_json::to_vec(self)?)
    }

    pub fn load(path: &Path) -> FlowResult<Self> {
        Ok(serde_json::from_slice(&read_resource(path)?)?)
    }

    /// Save to `path` and describe the result as a dataset reference
    pub fn into_dataset(self, path: PathBuf) -> FlowResult<DatasetRef> {
        self.save(&path)?;
        let preview = self
            .rows
            .iter()
            .take(PREVIEW_ROWS)
            .map(|row| row.iter().map(render_cell).collect())
            .collect();
        Ok(DatasetRef::new(path, self.columns).with_preview(preview))
    }
}

fn render_cell(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runs read-only queries on a SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteExtractor {
    database: PathBuf,
}

impl SqliteExtractor {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
        }
    }

    fn connect(&self) -> FlowResult<Connection> {
        if !self.database.is_file() {
            return Err(FlowError::MissingResource(self.database.clone()));
        }
        Ok(Connection::open_with_flags(
            &self.database,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }

    /// Run `sql` and collect every row
    pub fn query(&self, sql: &str) -> FlowResult<DatasetSnapshot> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(sql)?;

        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        if columns.is_empty() {
            return Err(FlowError::service(
                "sql execution",
                "statement does not return any columns",
            ));
        }

        let width = columns.len();
        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(json_value(row.get_ref(i)?));
            }
            rows.push(values);
        }

        debug!(rows = rows.len(), columns = width, "query finished");
        Ok(DatasetSnapshot { columns, rows })
    }

    /// Describe a table's columns for the SQL generator
    pub fn schema_description(&self, table: &str) -> FlowResult<String> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
        let columns: Vec<String> = stmt
            .query_map([table], |row| {
                Ok(format!(
                    "{} {}",
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?
                ))
            })?
            .collect::<Result<_, _>>()?;

        if columns.is_empty() {
            return Err(FlowError::Config(format!("table '{table}' not found")));
        }
        Ok(format!("Table: \"{}\":\n{}", table, columns.join("\n")))
    }
}

fn json_value(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => JsonValue::from(f),
        ValueRef::Text(t) => JsonValue::from(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonValue::from(format!("<{} bytes>", b.len())),
    }
}

impl DataExtractor for SqliteExtractor {
    fn extract(&self, sql: &str, artifacts: &ArtifactPaths) -> FlowResult<DatasetRef> {
        if sql.trim().is_empty() {
            return Err(FlowError::precondition("extract_data", "SQL query is empty"));
        }
        self.query(sql)?.into_dataset(artifacts.dataset())
    }
}
