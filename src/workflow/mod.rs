//! The analytics conversation as a stage graph
//!
//! ```text
//! sql_generate -> confirm_sql -> extract_data -> confirm_data
//!     -> data_query_prompt -> plot -> summarize -> data_query_prompt ...
//! ```
//!
//! The direct mode drops the three interactive stages and ends after
//! `summarize`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::engine::graph::{CompiledGraph, Stage, StateGraph, DEFAULT_MAX_STEPS};
use crate::error::{FlowError, FlowResult};
use crate::services::Services;
use crate::END;

pub mod stages;

pub const SQL_GENERATE: &str = "sql_generate";
pub const CONFIRM_SQL: &str = "confirm_sql";
pub const EXTRACT_DATA: &str = "extract_data";
pub const CONFIRM_DATA: &str = "confirm_data";
pub const DATA_QUERY_PROMPT: &str = "data_query_prompt";
pub const PLOT: &str = "plot";
pub const SUMMARIZE: &str = "summarize";

const APPROVALS: [&str; 5] = ["yes", "y", "ye", "yeah", "sure"];

const QUIT_KEYWORDS: [&str; 4] = ["quit", "stop", "end", "finish"];

/// Lexical approval check for confirmation answers
///
/// English-only; anything outside the set is a rejection.
pub fn is_approval(answer: &str) -> bool {
    let normalized = answer.trim().to_lowercase();
    APPROVALS.contains(&normalized.as_str())
}

/// True when a refinement answer asks to leave the plotting loop
pub fn is_quit(answer: &str) -> bool {
    let normalized = answer.trim().to_lowercase();
    QUIT_KEYWORDS.contains(&normalized.as_str())
}

/// Whether the conversation pauses for human confirmation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    /// Confirm SQL and data, then loop on plotting instructions
    #[default]
    Hitl,
    /// Question to summary in one pass
    Direct,
}

impl WorkflowMode {
    pub fn is_interactive(self) -> bool {
        matches!(self, WorkflowMode::Hitl)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowMode::Hitl => "hitl",
            WorkflowMode::Direct => "direct",
        }
    }

    fn after_sql(self) -> &'static str {
        match self {
            WorkflowMode::Hitl => CONFIRM_SQL,
            WorkflowMode::Direct => EXTRACT_DATA,
        }
    }

    fn after_extract(self) -> &'static str {
        match self {
            WorkflowMode::Hitl => CONFIRM_DATA,
            WorkflowMode::Direct => PLOT,
        }
    }

    fn after_summary(self) -> &'static str {
        match self {
            WorkflowMode::Hitl => DATA_QUERY_PROMPT,
            WorkflowMode::Direct => END,
        }
    }
}

impl std::str::FromStr for WorkflowMode {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hitl" => Ok(WorkflowMode::Hitl),
            "direct" => Ok(WorkflowMode::Direct),
            other => Err(FlowError::Config(format!("unknown workflow mode '{}'", other))),
        }
    }
}

impl std::fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the conversation graph with the default step bound
pub fn build_workflow(services: Arc<Services>, mode: WorkflowMode) -> FlowResult<CompiledGraph> {
    build_workflow_with_max_steps(services, mode, DEFAULT_MAX_STEPS)
}

pub fn build_workflow_with_max_steps(
    services: Arc<Services>,
    mode: WorkflowMode,
    max_steps: usize,
) -> FlowResult<CompiledGraph> {
    let mut graph =
        StateGraph::with_name(format!("chartflow-{}", mode.as_str())).with_max_steps(max_steps);

    let s = services.clone();
    graph.add_stage(
        Stage::new(SQL_GENERATE)
            .with_description("Translate the question into SQL")
            .with_run(move |state, _| stages::sql_generate(&s, mode, state)),
    );

    let s = services.clone();
    graph.add_stage(
        Stage::new(EXTRACT_DATA)
            .with_description("Run the SQL and snapshot the result")
            .with_run(move |state, _| stages::extract_data(&s, mode, state)),
    );

    let s = services.clone();
    graph.add_stage(
        Stage::new(PLOT)
            .with_description("Render a chart from the dataset")
            .with_run(move |state, _| stages::plot(&s, state)),
    );

    let s = services;
    graph.add_stage(
        Stage::new(SUMMARIZE)
            .with_description("Describe the chart")
            .with_run(move |state, _| stages::summarize(&s, mode, state)),
    );

    if mode.is_interactive() {
        graph.add_stage(
            Stage::new(CONFIRM_SQL)
                .interactive()
                .with_description("Ask the user to approve the SQL")
                .with_run(stages::confirm_sql),
        );
        graph.add_stage(
            Stage::new(CONFIRM_DATA)
                .interactive()
                .with_description("Ask the user to approve the extracted rows")
                .with_run(stages::confirm_data),
        );
        graph.add_stage(
            Stage::new(DATA_QUERY_PROMPT)
                .interactive()
                .with_description("Ask for plotting instructions")
                .with_run(stages::data_query_prompt),
        );
    }

    graph.set_entry_point(SQL_GENERATE)?;
    graph.add_simple_edge(SQL_GENERATE, mode.after_sql())?;
    graph.add_simple_edge(EXTRACT_DATA, mode.after_extract())?;
    graph.add_simple_edge(PLOT, SUMMARIZE)?;
    graph.add_simple_edge(SUMMARIZE, mode.after_summary())?;

    if mode.is_interactive() {
        graph.add_labeled_edge(CONFIRM_SQL, EXTRACT_DATA, "approved")?;
        graph.add_labeled_edge(CONFIRM_SQL, END, "rejected")?;
        graph.add_labeled_edge(CONFIRM_DATA, DATA_QUERY_PROMPT, "approved")?;
        graph.add_labeled_edge(CONFIRM_DATA, END, "rejected")?;
        graph.add_labeled_edge(DATA_QUERY_PROMPT, PLOT, "instruction")?;
        graph.add_labeled_edge(DATA_QUERY_PROMPT, END, "quit")?;
    }

    graph.compile()
}
