//! Chart rendering through an external plotting command

use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::engine::state::DatasetRef;
use crate::error::{FlowError, FlowResult};
use crate::services::{ArtifactPaths, ChartGenerator};

/// Environment handed to the plotting command
pub const ENV_DATASET: &str = "CHARTFLOW_DATASET";
pub const ENV_COLUMNS: &str = "CHARTFLOW_COLUMNS";
pub const ENV_INSTRUCTION: &str = "CHARTFLOW_INSTRUCTION";
pub const ENV_CHART: &str = "CHARTFLOW_CHART";

/// Runs `program args...` and expects it to write the chart file
///
/// The command receives the dataset snapshot path, its column names, the
/// plotting instruction and the target chart path through the `CHARTFLOW_*`
/// environment variables. It must not transform the data, only plot it.
#[derive(Debug, Clone)]
pub struct CommandChartGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandChartGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a `[program, args...]` list
    pub fn from_argv(argv: &[String]) -> FlowResult<Self> {
        match argv.split_first() {
            Some((program, args)) if !program.trim().is_empty() => {
                Ok(Self::new(program.clone(), args.to_vec()))
            }
            _ => Err(FlowError::Config("plot.command is empty".to_string())),
        }
    }
}

impl ChartGenerator for CommandChartGenerator {
    fn generate(
        &self,
        dataset: &DatasetRef,
        instruction: &str,
        artifacts: &ArtifactPaths,
    ) -> FlowResult<PathBuf> {
        let chart = artifacts.chart();
        // A chart from an earlier turn must not pass for this one
        if chart.is_file() {
            fs::remove_file(&chart)?;
        }

        debug!(program = %self.program, chart = %chart.display(), "running plot command");
        let output = Command::new(&self.program)
            .args(&self.args)
            .env(ENV_DATASET, &dataset.path)
            .env(ENV_COLUMNS, dataset.columns.join(","))
            .env(ENV_INSTRUCTION, instruction)
            .env(ENV_CHART, &chart)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| FlowError::service("chart generation", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlowError::service(
                "chart generation",
                format!("plot command exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        if !chart.exists() {
            return Err(FlowError::MissingResource(chart));
        }
        Ok(chart)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> CommandChartGenerator {
        CommandChartGenerator::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn dataset(dir: &std::path::Path) -> DatasetRef {
        DatasetRef::new(dir.join("data_c1.json"), vec!["category".into(), "count".into()])
    }

    #[test]
    fn test_command_writes_chart() {
        let dir = tempdir().unwrap();
        let artifacts = ArtifactPaths::new(dir.path(), "c1");
        let generator = sh("printf '%s|%s' \"$CHARTFLOW_COLUMNS\" \"$CHARTFLOW_INSTRUCTION\" > \"$CHARTFLOW_CHART\"");

        let chart = generator
            .generate(&dataset(dir.path()), "bar chart", &artifacts)
            .unwrap();

        assert_eq!(chart, artifacts.chart());
        assert_eq!(fs::read_to_string(chart).unwrap(), "category,count|bar chart");
    }

    #[test]
    fn test_command_failure_is_service_error() {
        let dir = tempdir().unwrap();
        let err = sh("echo boom >&2; exit 3")
            .generate(&dataset(dir.path()), "x", &ArtifactPaths::new(dir.path(), "c1"))
            .unwrap_err();

        match err {
            FlowError::Service { message, .. } => assert!(message.contains("boom")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_output_is_reported() {
        let dir = tempdir().unwrap();
        let artifacts = ArtifactPaths::new(dir.path(), "c1");
        fs::write(artifacts.chart(), b"stale").unwrap();

        let err = sh("true")
            .generate(&dataset(dir.path()), "x", &artifacts)
            .unwrap_err();
        assert!(matches!(err, FlowError::MissingResource(_)));
    }

    #[test]
    fn test_from_argv_requires_program() {
        assert!(CommandChartGenerator::from_argv(&[]).is_err());
        assert!(CommandChartGenerator::from_argv(&["python3".to_string()]).is_ok());
    }
}
