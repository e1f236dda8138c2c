//! chartflow - conversational analytics on a human-in-the-loop stage graph
//!
//! A question in natural language is turned into SQL, run against the
//! analytics store, plotted and summarized. Between those steps the graph
//! can pause for a human decision and pick up later from a checkpoint, as if
//! the answer had been there all along.
//!
//! # Features
//!
//! - Stage graph on petgraph with declared transitions and a step bound
//! - Replay-based interrupt/resume keyed by conversation id
//! - Checkpoints after every stage, in memory or on disk (MessagePack or JSON)
//! - Service traits for SQL generation, execution, charting and summaries
//! - Fixture services for offline runs and tests
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use chartflow::engine::executor::Executor;
//! use chartflow::services::fixtures::fixture_services;
//! use chartflow::workflow::{build_workflow, WorkflowMode};
//!
//! let services = Arc::new(fixture_services(std::env::temp_dir().join("chartflow-doc")));
//! let graph = build_workflow(services, WorkflowMode::Hitl)?;
//! let executor = Executor::in_memory(graph);
//!
//! let outcome = executor.invoke("conversation-1", "show category counts")?;
//! assert_eq!(outcome.interrupt().map(|i| i.stage.as_str()), Some("confirm_sql"));
//!
//! let outcome = executor.resume("conversation-1", "yes")?;
//! assert_eq!(outcome.interrupt().map(|i| i.stage.as_str()), Some("confirm_data"));
//! # Ok::<(), chartflow::FlowError>(())
//! ```

pub mod config;
pub mod engine;
pub mod services;
pub mod workflow;
mod error;

// Re-exports
pub use config::FlowConfig;
pub use engine::checkpoint::{
    Checkpoint, Checkpointer, FileCheckpointer, MemoryCheckpointer, TurnStatus,
};
pub use engine::executor::{
    EventType, ExecutionEvent, Executor, RunOutcome, StateSnapshot, TurnInput,
};
pub use engine::graph::{Command, CompiledGraph, Goto, Stage, StateGraph};
pub use engine::interrupt::{Interrupt, InterruptContext, ResumeToken};
pub use engine::state::{ChartRef, DatasetRef, StateUpdate, WorkflowState};
pub use error::{FlowError, FlowResult};
pub use services::Services;
pub use workflow::{build_workflow, WorkflowMode};

/// Special constant for the END stage
pub const END: &str = "__end__";

/// Special constant for the START stage
pub const START: &str = "__start__";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        build_workflow, Checkpoint, Checkpointer, Command, CompiledGraph, Executor,
        FileCheckpointer, FlowConfig, FlowError, FlowResult, Interrupt, InterruptContext,
        MemoryCheckpointer, RunOutcome, Services, Stage, StateGraph, StateUpdate, WorkflowMode,
        WorkflowState, END, START,
    };
}
