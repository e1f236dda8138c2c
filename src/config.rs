//! Runtime configuration loaded from YAML
//!
//! ```yaml
//! mode: hitl
//! max_steps: 25
//! artifact_dir: /tmp/chartflow
//! checkpoint:
//!   backend: file
//!   dir: .chartflow/checkpoints
//!   format: json
//!   history_limit: 64
//! database:
//!   path: data/purchases.db
//!   table: purchases
//! llm:
//!   api_base: https://api.openai.com/v1
//!   model: gpt-4o-mini
//!   api_key_env: OPENAI_API_KEY
//! plot:
//!   command: ["python3", "scripts/plot.py"]
//! ```
//!
//! Every field has a default. A few settings can be overridden from the
//! environment, see [`FlowConfig::apply_env`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::checkpoint::{
    Checkpointer, FileCheckpointer, MemoryCheckpointer, DEFAULT_HISTORY_LIMIT,
};
use crate::engine::executor::Executor;
use crate::engine::graph::DEFAULT_MAX_STEPS;
use crate::engine::retry::RetryConfig;
use crate::error::{FlowError, FlowResult};
use crate::services::command::CommandChartGenerator;
use crate::services::fixtures::Fixtures;
use crate::services::sqlite::SqliteExtractor;
use crate::services::Services;
use crate::workflow::{build_workflow_with_max_steps, WorkflowMode};

pub const ENV_TEST_MODE: &str = "CHARTFLOW_TEST_MODE";
pub const ENV_DATABASE: &str = "CHARTFLOW_DATABASE";
pub const ENV_ARTIFACT_DIR: &str = "CHARTFLOW_ARTIFACT_DIR";
pub const ENV_CHECKPOINT_DIR: &str = "CHARTFLOW_CHECKPOINT_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub mode: WorkflowMode,

    /// Bound on stages run by one invoke or resume
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Where dataset snapshots and charts are written
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub plot: PlotConfig,

    /// Replace every external service with fixtures
    #[serde(default)]
    pub test_mode: bool,
}

fn default_max_steps() -> usize {
    DEFAULT_MAX_STEPS
}

fn default_artifact_dir() -> PathBuf {
    std::env::temp_dir().join("chartflow")
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            mode: WorkflowMode::default(),
            max_steps: default_max_steps(),
            artifact_dir: default_artifact_dir(),
            checkpoint: CheckpointConfig::default(),
            database: DatabaseConfig::default(),
            llm: LlmConfig::default(),
            plot: PlotConfig::default(),
            test_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// Process lifetime only
    #[default]
    Memory,
    /// Survives restarts
    File,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointFormat {
    #[default]
    Binary,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,

    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub format: CheckpointFormat,

    /// Checkpoints kept per conversation by the memory backend
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".chartflow/checkpoints")
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            dir: default_checkpoint_dir(),
            format: CheckpointFormat::default(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Table described to the SQL generator
    #[serde(default = "default_table")]
    pub table: String,

    /// Dialect name passed to the SQL generator
    #[serde(default = "default_engine")]
    pub engine: String,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/purchases.db")
}
fn default_table() -> String {
    "purchases".to_string()
}
fn default_engine() -> String {
    "sqlite".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            table: default_table(),
            engine: default_engine(),
        }
    }
}

/// Settings of the OpenAI-compatible provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlotConfig {
    /// `[program, args...]` run to render a chart
    #[serde(default)]
    pub command: Vec<String>,
}

impl FlowConfig {
    pub fn from_yaml_str(yaml: &str) -> FlowResult<Self> {
        let config: FlowConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> FlowResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FlowError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    fn validate(&self) -> FlowResult<()> {
        if self.max_steps == 0 {
            return Err(FlowError::Config("max_steps must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Apply the `CHARTFLOW_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_TEST_MODE) {
            self.test_mode = value.trim().eq_ignore_ascii_case("true");
        }
        if let Some(value) = lookup(ENV_DATABASE) {
            self.database.path = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_ARTIFACT_DIR) {
            self.artifact_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_CHECKPOINT_DIR) {
            self.checkpoint.backend = CheckpointBackend::File;
            self.checkpoint.dir = PathBuf::from(value);
        }
    }

    pub fn build_checkpointer(&self) -> FlowResult<Arc<dyn Checkpointer>> {
        let checkpointer: Arc<dyn Checkpointer> = match self.checkpoint.backend {
            CheckpointBackend::Memory => Arc::new(MemoryCheckpointer::with_history_limit(
                self.checkpoint.history_limit,
            )),
            CheckpointBackend::File => match self.checkpoint.format {
                CheckpointFormat::Binary => Arc::new(FileCheckpointer::new(&self.checkpoint.dir)?),
                CheckpointFormat::Json => Arc::new(FileCheckpointer::json(&self.checkpoint.dir)?),
            },
        };
        debug!(backend = ?self.checkpoint.backend, "checkpointer ready");
        Ok(checkpointer)
    }

    /// Construct the service handles, fixtures in test mode
    pub fn build_services(&self) -> FlowResult<Services> {
        std::fs::create_dir_all(&self.artifact_dir)?;

        if self.test_mode {
            info!("test mode: using fixture services");
            return Ok(Fixtures::new().services(&self.artifact_dir));
        }

        let extractor = SqliteExtractor::new(&self.database.path);
        let schema = extractor.schema_description(&self.database.table)?;
        let chart_generator = CommandChartGenerator::from_argv(&self.plot.command)?;
        let (sql_generator, summarizer) = self.llm_services()?;

        Ok(Services {
            sql_generator,
            extractor: Arc::new(extractor),
            chart_generator: Arc::new(chart_generator),
            summarizer,
            schema,
            engine: self.database.engine.clone(),
            artifact_dir: self.artifact_dir.clone(),
        })
    }

    #[cfg(feature = "llm")]
    fn llm_services(
        &self,
    ) -> FlowResult<(
        Arc<dyn crate::services::SqlGenerator>,
        Arc<dyn crate::services::ChartSummarizer>,
    )> {
        use crate::services::llm::{LlmChartSummarizer, LlmClient, LlmSqlGenerator};

        Ok((
            Arc::new(LlmSqlGenerator::new(LlmClient::from_config(&self.llm)?)),
            Arc::new(LlmChartSummarizer::new(LlmClient::from_config(&self.llm)?)),
        ))
    }

    #[cfg(not(feature = "llm"))]
    fn llm_services(
        &self,
    ) -> FlowResult<(
        Arc<dyn crate::services::SqlGenerator>,
        Arc<dyn crate::services::ChartSummarizer>,
    )> {
        Err(FlowError::Config(
            "built without the `llm` feature; enable it or run in test mode".to_string(),
        ))
    }

    /// Build services, graph and checkpointer for `mode`
    pub fn build_executor(&self, mode: WorkflowMode) -> FlowResult<Executor> {
        let services = Arc::new(self.build_services()?);
        let graph = build_workflow_with_max_steps(services, mode, self.max_steps)?;
        Ok(Executor::new(graph, self.build_checkpointer()?))
    }
}
