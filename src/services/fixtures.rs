//! Deterministic stand-ins for every external service
//!
//! Used by test mode (`--test-mode`, `CHARTFLOW_TEST_MODE=true`) and by the
//! test suite. Each fixture counts its calls so tests can assert that a
//! rejected turn never reaches the services after the rejection point.

use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::engine::state::{write_resource, DatasetRef};
use crate::error::{FlowError, FlowResult};
use crate::services::sqlite::DatasetSnapshot;
use crate::services::{
    ArtifactPaths, ChartGenerator, ChartSummarizer, ChartSummary, DataExtractor, SqlGenerator,
    Services,
};

pub const FIXTURE_SQL: &str = "SELECT category, COUNT(*) FROM purchases GROUP BY category;";

pub const FIXTURE_SUMMARY: &str = "Among various product categories, clothing items are the most \
numerous, with approximately 1700 instances. Accessories represent the second-largest category, \
totaling around 1200 instances. Footwear has a count of about 600, while outerwear is the least \
frequent category, with roughly 350 instances. This distribution suggests a significantly higher \
volume or demand for clothing and accessories compared to footwear and outerwear.";

pub const FIXTURE_CAPTION: &str =
    "Distribution of item counts across different product categories.";

/// 1x1 transparent PNG
pub const FIXTURE_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f, 0x15, 0xc4,
    0x89, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae,
    0x42, 0x60, 0x82,
];

fn fixture_snapshot() -> DatasetSnapshot {
    DatasetSnapshot {
        columns: vec!["category".to_string(), "COUNT(*)".to_string()],
        rows: vec![
            vec![json!("Accessories"), json!(1240)],
            vec![json!("Clothing"), json!(1737)],
            vec![json!("Footwear"), json!(599)],
            vec![json!("Outerwear"), json!(324)],
        ],
    }
}

#[derive(Debug, Default)]
pub struct FixtureSqlGenerator {
    calls: AtomicUsize,
}

impl FixtureSqlGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SqlGenerator for FixtureSqlGenerator {
    fn generate(&self, _query: &str, _schema: &str, _engine: &str) -> FlowResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FIXTURE_SQL.to_string())
    }
}

#[derive(Debug, Default)]
pub struct FixtureExtractor {
    calls: AtomicUsize,
}

impl FixtureExtractor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DataExtractor for FixtureExtractor {
    fn extract(&self, sql: &str, artifacts: &ArtifactPaths) -> FlowResult<DatasetRef> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if sql.trim().is_empty() {
            return Err(FlowError::precondition("extract_data", "SQL query is empty"));
        }
        fixture_snapshot().into_dataset(artifacts.dataset())
    }
}

#[derive(Debug, Default)]
pub struct FixtureChartGenerator {
    calls: AtomicUsize,
}

impl FixtureChartGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChartGenerator for FixtureChartGenerator {
    fn generate(
        &self,
        _dataset: &DatasetRef,
        _instruction: &str,
        artifacts: &ArtifactPaths,
    ) -> FlowResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let chart = artifacts.chart();
        write_resource(&chart, FIXTURE_PNG)?;
        Ok(chart)
    }
}

#[derive(Debug, Default)]
pub struct FixtureSummarizer {
    calls: AtomicUsize,
}

impl FixtureSummarizer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ChartSummarizer for FixtureSummarizer {
    fn summarize(&self, _image: &[u8], _instruction: &str) -> FlowResult<ChartSummary> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ChartSummary {
            summary: FIXTURE_SUMMARY.to_string(),
            caption: FIXTURE_CAPTION.to_string(),
        })
    }
}

/// Fixture handles kept alongside the [`Services`] bundle built from them
#[derive(Debug, Clone, Default)]
pub struct Fixtures {
    pub sql_generator: Arc<FixtureSqlGenerator>,
    pub extractor: Arc<FixtureExtractor>,
    pub chart_generator: Arc<FixtureChartGenerator>,
    pub summarizer: Arc<FixtureSummarizer>,
}

impl Fixtures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self, artifact_dir: impl Into<PathBuf>) -> Services {
        Services {
            sql_generator: self.sql_generator.clone(),
            extractor: self.extractor.clone(),
            chart_generator: self.chart_generator.clone(),
            summarizer: self.summarizer.clone(),
            schema: "Table: \"purchases\":\ncategory TEXT".to_string(),
            engine: "sqlite".to_string(),
            artifact_dir: artifact_dir.into(),
        }
    }

    /// Calls across all four services
    pub fn total_calls(&self) -> usize {
        self.sql_generator.calls()
            + self.extractor.calls()
            + self.chart_generator.calls()
            + self.summarizer.calls()
    }
}

/// Fixture services writing their artifacts under `artifact_dir`
pub fn fixture_services(artifact_dir: impl Into<PathBuf>) -> Services {
    Fixtures::new().services(artifact_dir)
}

/// A service that always fails with the given message
#[derive(Debug, Clone)]
pub struct FailingService {
    message: String,
}

impl FailingService {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn fail<T>(&self, service: &str) -> FlowResult<T> {
        Err(FlowError::service(service, self.message.clone()))
    }
}

impl SqlGenerator for FailingService {
    fn generate(&self, _query: &str, _schema: &str, _engine: &str) -> FlowResult<String> {
        self.fail("sql generation")
    }
}

impl DataExtractor for FailingService {
    fn extract(&self, _sql: &str, _artifacts: &ArtifactPaths) -> FlowResult<DatasetRef> {
        self.fail("sql execution")
    }
}

impl ChartGenerator for FailingService {
    fn generate(
        &self,
        _dataset: &DatasetRef,
        _instruction: &str,
        _artifacts: &ArtifactPaths,
    ) -> FlowResult<PathBuf> {
        self.fail("chart generation")
    }
}

impl ChartSummarizer for FailingService {
    fn summarize(&self, _image: &[u8], _instruction: &str) -> FlowResult<ChartSummary> {
        self.fail("chart summary")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_fixture_pipeline_writes_artifacts() {
        let dir = tempdir().unwrap();
        let fixtures = Fixtures::new();
        let services = fixtures.services(dir.path());
        let artifacts = services.artifacts("c1");

        let sql = services.sql_generator.generate("q", "", "sqlite").unwrap();
        assert_eq!(sql, FIXTURE_SQL);

        let dataset = services.extractor.extract(&sql, &artifacts).unwrap();
        assert!(dataset.path.is_file());
        assert_eq!(dataset.preview.len(), 4);

        let chart = services
            .chart_generator
            .generate(&dataset, "q", &artifacts)
            .unwrap();
        assert_eq!(fs::read(&chart).unwrap(), FIXTURE_PNG);

        let summary = services.summarizer.summarize(FIXTURE_PNG, "q").unwrap();
        assert_eq!(summary.caption, FIXTURE_CAPTION);

        assert_eq!(fixtures.total_calls(), 4);
    }

    #[test]
    fn test_failing_service() {
        let err = SqlGenerator::generate(&FailingService::new("503 unavailable"), "q", "", "")
            .unwrap_err();
        assert_eq!(err.to_string(), "sql generation service failed: 503 unavailable");
    }
}
