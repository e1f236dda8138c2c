//! Retry with exponential backoff for external service adapters
//!
//! The stage graph never retries on its own; adapters that talk to hosted
//! providers wrap their calls here.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{FlowError, FlowResult};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to add jitter
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    2
}
fn default_base_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Retry executor
pub struct RetryExecutor {
    /// Disable jitter regardless of config (for testing)
    deterministic: bool,
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self {
            deterministic: false,
        }
    }

    /// Create a deterministic executor (for testing)
    pub fn deterministic() -> Self {
        Self {
            deterministic: true,
        }
    }

    /// Run `f`, retrying transient failures
    pub fn execute_with_retry<T, F>(&self, mut f: F, config: &RetryConfig) -> FlowResult<T>
    where
        F: FnMut() -> FlowResult<T>,
    {
        let mut attempt = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < config.max_retries && is_transient(&e) => {
                    let delay = self.delay_for(attempt, config);
                    debug!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn delay_for(&self, attempt: u32, config: &RetryConfig) -> Duration {
        let delay = self.calculate_delay(attempt, config);
        if config.jitter && !self.deterministic {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    /// Add jitter to delay (±20%)
    fn add_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_factor: f64 = rng.gen_range(0.8..1.2);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor)
    }

    /// Calculate delay for a specific attempt
    pub fn calculate_delay(&self, attempt: u32, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms as f64;
        let max = config.max_delay_ms as f64;

        let delay_ms = (base * config.backoff_multiplier.powi(attempt as i32)).min(max);
        Duration::from_millis(delay_ms as u64)
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if an error is transient (temporary failure)
pub fn is_transient(error: &FlowError) -> bool {
    match error {
        FlowError::Http(_) => true,
        FlowError::Service { message, .. } => {
            message.contains("429") || message.contains("503") || message.contains("502")
        }
        _ => false,
    }
}
