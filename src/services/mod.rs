//! External collaborators of the stage graph
//!
//! Each service is a blocking call with a narrow contract: given X, return Y
//! or fail. Handles are bundled in [`Services`], built once and captured by
//! the stage functions.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::state::DatasetRef;
use crate::error::FlowResult;

pub mod command;
pub mod fixtures;
#[cfg(feature = "llm")]
pub mod llm;
pub mod sqlite;

/// Natural language to SQL
pub trait SqlGenerator: Send + Sync {
    fn generate(&self, query: &str, schema: &str, engine: &str) -> FlowResult<String>;
}

/// Runs SQL and snapshots the result
pub trait DataExtractor: Send + Sync {
    fn extract(&self, sql: &str, artifacts: &ArtifactPaths) -> FlowResult<DatasetRef>;
}

/// Renders a chart file from a dataset snapshot
pub trait ChartGenerator: Send + Sync {
    fn generate(
        &self,
        dataset: &DatasetRef,
        instruction: &str,
        artifacts: &ArtifactPaths,
    ) -> FlowResult<PathBuf>;
}

/// Describes a rendered chart
pub trait ChartSummarizer: Send + Sync {
    fn summarize(&self, image: &[u8], instruction: &str) -> FlowResult<ChartSummary>;
}

/// Output of the chart summarizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSummary {
    pub summary: String,
    pub caption: String,
}

/// Conversation-scoped artifact locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    dir: PathBuf,
    conversation_id: String,
}

impl ArtifactPaths {
    pub fn new(dir: impl Into<PathBuf>, conversation_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            conversation_id: conversation_id.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Tabular snapshot of the current turn
    pub fn dataset(&self) -> PathBuf {
        self.dir.join(format!("data_{}.json", self.conversation_id))
    }

    /// Default chart location of the current turn
    pub fn chart(&self) -> PathBuf {
        self.dir.join(format!("plot_{}.png", self.conversation_id))
    }
}

/// Service handles plus the context they need
#[derive(Clone)]
pub struct Services {
    pub sql_generator: Arc<dyn SqlGenerator>,
    pub extractor: Arc<dyn DataExtractor>,
    pub chart_generator: Arc<dyn ChartGenerator>,
    pub summarizer: Arc<dyn ChartSummarizer>,

    /// Schema description handed to the SQL generator
    pub schema: String,

    /// SQL dialect name handed to the SQL generator
    pub engine: String,

    /// Directory for per-conversation artifacts
    pub artifact_dir: PathBuf,
}

impl Services {
    pub fn artifacts(&self, conversation_id: &str) -> ArtifactPaths {
        ArtifactPaths::new(&self.artifact_dir, conversation_id)
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("engine", &self.engine)
            .field("artifact_dir", &self.artifact_dir)
            .field("schema_len", &self.schema.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_paths_are_conversation_scoped() {
        let paths = ArtifactPaths::new("/tmp/chartflow", "abc");

        assert_eq!(paths.dataset(), PathBuf::from("/tmp/chartflow/data_abc.json"));
        assert_eq!(paths.chart(), PathBuf::from("/tmp/chartflow/plot_abc.png"));
        assert_ne!(
            paths.dataset(),
            ArtifactPaths::new("/tmp/chartflow", "xyz").dataset()
        );
    }
}
