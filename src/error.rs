//! Error types for chartflow

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::interrupt::Interrupt;

/// Main error type for chartflow
#[derive(Error, Debug)]
pub enum FlowError {
    // Graph errors
    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Stage not found: {0}")]
    NodeNotFound(String),

    #[error("No entry point defined")]
    NoEntryPoint,

    #[error("Stage '{from}' cannot transition to '{to}'")]
    InvalidTransition { from: String, to: String },

    // Execution errors
    #[error("Precondition failed at stage '{stage}': {message}")]
    Precondition { stage: String, message: String },

    #[error("Execution error at stage '{stage}': {message}")]
    Execution { stage: String, message: String },

    #[error("Max steps ({0}) exceeded in a single invocation")]
    MaxStepsExceeded(usize),

    // External collaborators
    #[error("{service} service failed: {message}")]
    Service { service: String, message: String },

    #[error("HTTP error: {0}")]
    Http(String),

    // Resource integrity
    #[error("File {} doesn't exist", .0.display())]
    MissingResource(PathBuf),

    #[error("File {} is a directory, not a file", .0.display())]
    NotAFile(PathBuf),

    #[error("File {} is not accessible: {message}", path.display())]
    InaccessibleResource { path: PathBuf, message: String },

    // Suspend/resume protocol
    #[error("Interrupt at stage '{}'", .0.stage)]
    Interrupted(Interrupt),

    #[error("Conversation '{0}' has no pending interrupt to resume")]
    InvalidResume(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    // Checkpoint errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // Config errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FlowError {
    /// Build a service failure
    pub fn service(service: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::Service {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Build a precondition violation for a stage
    pub fn precondition(stage: impl Into<String>, message: impl Into<String>) -> Self {
        FlowError::Precondition {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// True for failures that abort the current turn but leave the conversation usable
    pub fn is_turn_fatal(&self) -> bool {
        matches!(
            self,
            FlowError::Precondition { .. }
                | FlowError::Service { .. }
                | FlowError::Http(_)
                | FlowError::MissingResource(_)
                | FlowError::NotAFile(_)
                | FlowError::InaccessibleResource { .. }
                | FlowError::Execution { .. }
                | FlowError::MaxStepsExceeded(_)
        )
    }

    /// Message suitable for showing to the person driving the conversation
    pub fn user_message(&self) -> String {
        match self {
            FlowError::Service { message, .. } if message.contains("API key not valid") => {
                "API key not valid. Please pass a valid API key.".to_string()
            }
            FlowError::Service { .. } | FlowError::Http(_) => {
                "Something went wrong with the request.".to_string()
            }
            FlowError::Precondition { message, .. } => message.clone(),
            FlowError::InaccessibleResource { path, .. } => {
                format!("File {} can't be accessed.", path.display())
            }
            FlowError::InvalidResume(_) => {
                "There is nothing waiting for an answer. Ask a new question.".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Result type alias for chartflow
pub type FlowResult<T> = Result<T, FlowError>;

// Conversion implementations
impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for FlowError {
    fn from(err: serde_yaml::Error) -> Self {
        FlowError::Config(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FlowError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FlowError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for FlowError {
    fn from(err: rusqlite::Error) -> Self {
        FlowError::service("sql execution", err.to_string())
    }
}

#[cfg(feature = "llm")]
impl From<reqwest::Error> for FlowError {
    fn from(err: reqwest::Error) -> Self {
        FlowError::Http(err.to_string())
    }
}
