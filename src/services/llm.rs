//! OpenAI-compatible adapters for SQL generation and chart summaries
//!
//! Both adapters share one [`LlmClient`] that posts to
//! `{api_base}/chat/completions`. Transient provider failures are retried
//! here; the stage graph itself never retries.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::debug;

use crate::config::LlmConfig;
use crate::engine::retry::RetryExecutor;
use crate::error::{FlowError, FlowResult};
use crate::services::{ChartSummarizer, ChartSummary, SqlGenerator};

/// OpenAI-compatible message format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: JsonValue,
}

impl Message {
    fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: JsonValue::String(text.into()),
        }
    }

    fn user(content: JsonValue) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

/// OpenAI-compatible request format
#[derive(Debug, Clone, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

/// OpenAI-compatible response format
#[derive(Debug, Clone, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Blocking chat-completions client
pub struct LlmClient {
    config: LlmConfig,
    api_key: Option<String>,
    http: reqwest::blocking::Client,
    retry: RetryExecutor,
}

impl LlmClient {
    pub fn from_config(config: &LlmConfig) -> FlowResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            api_key: std::env::var(&config.api_key_env).ok(),
            config: config.clone(),
            http,
            retry: RetryExecutor::new(),
        })
    }

    fn complete(&self, service: &str, messages: Vec<Message>) -> FlowResult<String> {
        let request = CompletionRequest {
            model: self.config.model.clone(),
            messages,
            temperature: Some(0.0),
        };
        let url = format!(
            "{}/chat/completions",
            self.config.api_base.trim_end_matches('/')
        );

        self.retry
            .execute_with_retry(|| self.send(service, &url, &request), &self.config.retry)
    }

    fn send(&self, service: &str, url: &str, request: &CompletionRequest) -> FlowResult<String> {
        let mut http_req = self.http.post(url).json(request);
        if let Some(ref key) = self.api_key {
            http_req = http_req.header("Authorization", format!("Bearer {}", key));
        }

        let response = http_req.send()?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(FlowError::service(service, format!("{}: {}", status, body)));
        }

        let completion: CompletionResponse = response.json()?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        debug!(service, model = %self.config.model, chars = content.len(), "completion received");
        Ok(content)
    }
}

const SQL_SYSTEM_PROMPT: &str = "You translate questions about a database into a single SQL query. \
Answer with the SQL statement only, no explanation.";

/// SQL generation backed by a chat model
pub struct LlmSqlGenerator {
    client: LlmClient,
}

impl LlmSqlGenerator {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

impl SqlGenerator for LlmSqlGenerator {
    fn generate(&self, query: &str, schema: &str, engine: &str) -> FlowResult<String> {
        let text = format!("Database engine: {engine}\n\nSchema:\n{schema}\n\nQuestion:\n{query}");
        let content = self.client.complete(
            "sql generation",
            vec![
                Message::system(SQL_SYSTEM_PROMPT),
                Message::user(JsonValue::String(text)),
            ],
        )?;

        let sql = extract_sql(&content);
        if sql.is_empty() {
            return Err(FlowError::service("sql generation", "model returned no SQL"));
        }
        Ok(sql)
    }
}

/// Strip markdown fences and surrounding whitespace from a model answer
pub fn extract_sql(content: &str) -> String {
    strip_fences(content).trim().to_string()
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag on the opening fence
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.strip_suffix("```").unwrap_or(body).trim()
}

const SUMMARY_SYSTEM_PROMPT: &str = "You analyze a chart image and explain what it shows \
with respect to the user's request. Reply with a JSON object with the keys \
\"summary\" (a short paragraph) and \"caption\" (one sentence).";

/// Chart summaries from a vision-capable chat model
pub struct LlmChartSummarizer {
    client: LlmClient,
}

impl LlmChartSummarizer {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

impl ChartSummarizer for LlmChartSummarizer {
    fn summarize(&self, image: &[u8], instruction: &str) -> FlowResult<ChartSummary> {
        let data_url = format!("data:image/png;base64,{}", BASE64.encode(image));
        let content = self.client.complete(
            "chart summary",
            vec![
                Message::system(SUMMARY_SYSTEM_PROMPT),
                Message::user(json!([
                    { "type": "text", "text": instruction },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ])),
            ],
        )?;
        parse_summary(&content)
    }
}

/// Parse the `{summary, caption}` object out of a model answer
pub fn parse_summary(content: &str) -> FlowResult<ChartSummary> {
    serde_json::from_str(strip_fences(content)).map_err(|e| {
        FlowError::service("chart summary", format!("unexpected model output: {}", e))
    })
}
