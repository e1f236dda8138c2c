//! Workflow state threaded through every stage of a conversation
//!
//! The state is a fixed-shape record. Stages never mutate it in place; they
//! return a [`StateUpdate`] holding complete replacement values for the fields
//! they own, and the executor applies it once the stage finishes.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{FlowError, FlowResult};

/// Number of rows kept in a dataset preview
pub const PREVIEW_ROWS: usize = 5;

/// Snapshot of an extracted dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRef {
    /// Where the snapshot was written
    pub path: PathBuf,

    /// Ordered column names
    pub columns: Vec<String>,

    /// First rows rendered as text
    #[serde(default)]
    pub preview: Vec<Vec<String>>,
}

impl DatasetRef {
    pub fn new(path: impl Into<PathBuf>, columns: Vec<String>) -> Self {
        Self {
            path: path.into(),
            columns,
            preview: Vec::new(),
        }
    }

    pub fn with_preview(mut self, rows: Vec<Vec<String>>) -> Self {
        self.preview = rows.into_iter().take(PREVIEW_ROWS).collect();
        self
    }

    /// Render columns and preview rows as a plain text table
    pub fn render_preview(&self) -> String {
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.len()).collect();
        for row in &self.preview {
            for (i, cell) in row.iter().enumerate() {
                if i < widths.len() {
                    widths[i] = widths[i].max(cell.len());
                }
            }
        }

        let mut out = String::new();
        let render_row = |out: &mut String, cells: &[String]| {
            let line: Vec<String> = cells
                .iter()
                .zip(&widths)
                .map(|(cell, w)| format!("{cell:<w$}", w = *w))
                .collect();
            let _ = writeln!(out, "{}", line.join(" | ").trim_end());
        };

        render_row(&mut out, &self.columns);
        for row in &self.preview {
            render_row(&mut out, row);
        }
        out
    }
}

/// Rendered chart artifact
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartRef {
    pub path: PathBuf,

    #[serde(default)]
    pub caption: String,
}

impl ChartRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            caption: String::new(),
        }
    }
}

/// State of one conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Stable key of the conversation, never reassigned
    pub conversation_id: String,

    /// Natural-language request of the current turn
    #[serde(default)]
    pub user_query: String,

    /// Plotting instruction of the current sub-turn
    #[serde(default)]
    pub data_query: String,

    /// Most recently generated SQL
    #[serde(default)]
    pub sql_query: String,

    #[serde(default)]
    pub dataset: Option<DatasetRef>,

    #[serde(default)]
    pub chart: Option<ChartRef>,

    /// Latest chart summary
    #[serde(default)]
    pub summary: String,
}

impl WorkflowState {
    /// Create the empty state of a new conversation
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Default::default()
        }
    }

    /// Start a new turn: keep the conversation, replace the question, drop turn outputs
    pub fn begin_turn(&mut self, user_query: impl Into<String>) {
        let query = user_query.into();
        self.data_query = query.clone();
        self.user_query = query;
        self.sql_query.clear();
        self.dataset = None;
        self.chart = None;
        self.summary.clear();
    }

    /// Apply a stage's update, replacing each field it carries
    pub fn apply(&mut self, update: StateUpdate) {
        if let Some(v) = update.data_query {
            self.data_query = v;
        }
        if let Some(v) = update.sql_query {
            self.sql_query = v;
        }
        if let Some(v) = update.dataset {
            self.dataset = v;
        }
        if let Some(v) = update.chart {
            self.chart = v;
        }
        if let Some(v) = update.summary {
            self.summary = v;
        }
    }

    pub fn require_user_query(&self, stage: &str) -> FlowResult<&str> {
        let query = self.user_query.trim();
        if query.is_empty() {
            return Err(FlowError::precondition(stage, "Query can't be empty"));
        }
        Ok(query)
    }

    pub fn require_sql(&self, stage: &str) -> FlowResult<&str> {
        let sql = self.sql_query.trim();
        if sql.is_empty() {
            return Err(FlowError::precondition(stage, "SQL query is empty"));
        }
        Ok(sql)
    }

    /// The dataset must be present and its snapshot readable
    pub fn require_dataset(&self, stage: &str) -> FlowResult<&DatasetRef> {
        let dataset = self
            .dataset
            .as_ref()
            .ok_or_else(|| FlowError::precondition(stage, "no dataset has been extracted"))?;
        require_regular_file(&dataset.path)?;
        Ok(dataset)
    }

    /// The chart path must exist and must not be a directory
    pub fn require_chart_file(&self, stage: &str) -> FlowResult<&ChartRef> {
        let chart = self
            .chart
            .as_ref()
            .ok_or_else(|| FlowError::precondition(stage, "no chart has been generated"))?;
        require_regular_file(&chart.path)?;
        Ok(chart)
    }
}

/// Check that `path` names an existing regular file
pub fn require_regular_file(path: &Path) -> FlowResult<()> {
    let meta = std::fs::metadata(path).map_err(|_| FlowError::MissingResource(path.into()))?;
    if meta.is_dir() {
        return Err(FlowError::NotAFile(path.into()));
    }
    Ok(())
}

/// Read an artifact, classifying failures as resource errors
pub fn read_resource(path: &Path) -> FlowResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| resource_error(path, e))
}

/// Write an artifact, creating its directory first
pub fn write_resource(path: &Path, bytes: &[u8]) -> FlowResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| resource_error(parent, e))?;
    }
    std::fs::write(path, bytes).map_err(|e| resource_error(path, e))
}

fn resource_error(path: &Path, err: std::io::Error) -> FlowError {
    match err.kind() {
        std::io::ErrorKind::NotFound => FlowError::MissingResource(path.into()),
        _ if path.is_dir() => FlowError::NotAFile(path.into()),
        _ => FlowError::InaccessibleResource {
            path: path.into(),
            message: err.to_string(),
        },
    }
}

/// Replacement values produced by one stage
///
/// `None` leaves a field untouched. For the optional fields the inner value
/// is the replacement, so `Some(None)` clears them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub data_query: Option<String>,
    pub sql_query: Option<String>,
    pub dataset: Option<Option<DatasetRef>>,
    pub chart: Option<Option<ChartRef>>,
    pub summary: Option<String>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn data_query(mut self, value: impl Into<String>) -> Self {
        self.data_query = Some(value.into());
        self
    }

    pub fn sql_query(mut self, value: impl Into<String>) -> Self {
        self.sql_query = Some(value.into());
        self
    }

    pub fn dataset(mut self, value: Option<DatasetRef>) -> Self {
        self.dataset = Some(value);
        self
    }

    pub fn chart(mut self, value: Option<ChartRef>) -> Self {
        self.chart = Some(value);
        self
    }

    pub fn summary(mut self, value: impl Into<String>) -> Self {
        self.summary = Some(value.into());
        self
    }
}
