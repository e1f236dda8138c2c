//! Stage graph built on petgraph
//!
//! A [`StateGraph`] is a directed graph of named stages. Edges declare which
//! destinations a stage may route to; the stage itself picks one of them at
//! runtime by returning a [`Command`]. Cycles are allowed, execution length is
//! bounded by `max_steps` per invocation.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::interrupt::InterruptContext;
use crate::engine::state::{StateUpdate, WorkflowState};
use crate::error::{FlowError, FlowResult};
use crate::{END, START};

/// Default bound on stages run by a single invoke or resume
pub const DEFAULT_MAX_STEPS: usize = 25;

/// Type alias for the stage function signature
pub type StageFn =
    Arc<dyn Fn(&WorkflowState, &mut InterruptContext) -> FlowResult<Command> + Send + Sync>;

/// Where to go after a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Goto {
    Stage(String),
    End,
}

impl Goto {
    pub fn name(&self) -> &str {
        match self {
            Goto::Stage(name) => name,
            Goto::End => END,
        }
    }
}

/// Result of a stage: the state update and the next destination
#[derive(Debug, Clone)]
pub struct Command {
    pub update: StateUpdate,
    pub goto: Goto,
}

impl Command {
    /// Route to `stage` without updating state
    pub fn goto(stage: impl Into<String>) -> Self {
        let stage = stage.into();
        let goto = if stage == END {
            Goto::End
        } else {
            Goto::Stage(stage)
        };
        Self {
            update: StateUpdate::default(),
            goto,
        }
    }

    /// Terminate the turn
    pub fn end() -> Self {
        Self {
            update: StateUpdate::default(),
            goto: Goto::End,
        }
    }

    pub fn with_update(mut self, update: StateUpdate) -> Self {
        self.update = update;
        self
    }
}

/// A stage in the graph
#[derive(Clone)]
pub struct Stage {
    /// Unique name of the stage
    pub name: String,

    /// The function run when the stage executes
    pub run: Option<StageFn>,

    /// Whether the stage asks a human for input
    pub interactive: bool,

    /// Short description used in graph listings
    pub description: Option<String>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: None,
            interactive: false,
            description: None,
        }
    }

    /// Set the stage function
    pub fn with_run<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkflowState, &mut InterruptContext) -> FlowResult<Command> + Send + Sync + 'static,
    {
        self.run = Some(Arc::new(f));
        self
    }

    /// Mark the stage as one that suspends for human input
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn is_reserved(&self) -> bool {
        self.name == START || self.name == END
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("has_run", &self.run.is_some())
            .field("interactive", &self.interactive)
            .field("description", &self.description)
            .finish()
    }
}

/// A declared transition between two stages
#[derive(Debug, Clone, Default)]
pub struct Edge {
    /// Optional label shown in diagrams (e.g. "approved")
    pub label: Option<String>,
}

impl Edge {
    pub fn simple() -> Self {
        Self { label: None }
    }

    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }
}

/// Mutable graph under construction
pub struct StateGraph {
    graph: DiGraph<Stage, Edge>,
    node_indices: HashMap<String, NodeIndex>,
    entry_point: Option<String>,

    /// Graph name
    pub name: String,

    max_steps: usize,
}

impl StateGraph {
    /// Create a new graph holding only START and END
    pub fn new() -> Self {
        let mut graph = Self {
            graph: DiGraph::new(),
            node_indices: HashMap::new(),
            entry_point: None,
            name: String::from("unnamed"),
            max_steps: DEFAULT_MAX_STEPS,
        };

        graph.add_stage(Stage::new(START));
        graph.add_stage(Stage::new(END));

        graph
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        let mut graph = Self::new();
        graph.name = name.into();
        graph
    }

    /// Set the bound on stages run per invocation
    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.max_steps = max;
        self
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Add a stage, replacing any stage with the same name
    pub fn add_stage(&mut self, stage: Stage) -> NodeIndex {
        if let Some(idx) = self.node_indices.get(&stage.name) {
            self.graph[*idx] = stage;
            return *idx;
        }
        let name = stage.name.clone();
        let idx = self.graph.add_node(stage);
        self.node_indices.insert(name, idx);
        idx
    }

    pub fn get_stage(&self, name: &str) -> Option<&Stage> {
        self.node_indices.get(name).map(|idx| &self.graph[*idx])
    }

    pub fn has_stage(&self, name: &str) -> bool {
        self.node_indices.contains_key(name)
    }

    /// Declare a transition
    pub fn add_edge(&mut self, from: &str, to: &str, edge: Edge) -> FlowResult<()> {
        let from_idx = self.index_of(from)?;
        let to_idx = self.index_of(to)?;
        if from == END {
            return Err(FlowError::Graph("END cannot have outgoing edges".to_string()));
        }
        self.graph.add_edge(from_idx, to_idx, edge);
        Ok(())
    }

    pub fn add_simple_edge(&mut self, from: &str, to: &str) -> FlowResult<()> {
        self.add_edge(from, to, Edge::simple())
    }

    pub fn add_labeled_edge(&mut self, from: &str, to: &str, label: &str) -> FlowResult<()> {
        self.add_edge(from, to, Edge::labeled(label))
    }

    /// Set the stage run first on every new turn
    pub fn set_entry_point(&mut self, stage: &str) -> FlowResult<()> {
        self.index_of(stage)?;
        self.entry_point = Some(stage.to_string());
        self.add_simple_edge(START, stage)
    }

    pub fn entry_point(&self) -> Option<&str> {
        self.entry_point.as_deref()
    }

    /// Names of the declared destinations of `stage`
    pub fn destinations(&self, stage: &str) -> Vec<&str> {
        self.outgoing_edges(stage)
            .into_iter()
            .map(|(target, _)| target)
            .collect()
    }

    pub fn outgoing_edges(&self, stage: &str) -> Vec<(&str, &Edge)> {
        let Some(idx) = self.node_indices.get(stage) else {
            return vec![];
        };

        let mut edges: Vec<(&str, &Edge)> = self
            .graph
            .edges_directed(*idx, Direction::Outgoing)
            .map(|e| (self.graph[e.target()].name.as_str(), e.weight()))
            .collect();
        // petgraph yields most recent edges first
        edges.reverse();
        edges
    }

    /// True when `from` declares a transition to `to`
    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        self.destinations(from).contains(&to)
    }

    /// Validate the graph structure
    pub fn validate(&self) -> FlowResult<()> {
        let entry = self.entry_point.as_ref().ok_or(FlowError::NoEntryPoint)?;

        for idx in self.graph.node_indices() {
            let stage = &self.graph[idx];
            if !stage.is_reserved() && stage.run.is_none() {
                return Err(FlowError::Graph(format!(
                    "Stage '{}' has no run function",
                    stage.name
                )));
            }
        }

        let start = self.node_indices[START];
        let mut reachable = std::collections::HashSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(idx) = dfs.next(&self.graph) {
            reachable.insert(idx);
        }

        for idx in self.graph.node_indices() {
            let stage = &self.graph[idx];
            if !stage.is_reserved() && !reachable.contains(&idx) {
                return Err(FlowError::Graph(format!(
                    "Stage '{}' is unreachable from '{}'",
                    stage.name, entry
                )));
            }
        }

        if !reachable.contains(&self.node_indices[END]) {
            return Err(FlowError::Graph("No path reaches END".to_string()));
        }

        Ok(())
    }

    /// Compile the graph for execution
    pub fn compile(self) -> FlowResult<CompiledGraph> {
        self.validate()?;
        Ok(CompiledGraph { graph: self })
    }

    /// Get the number of stages, START and END included
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Stage names in insertion order
    pub fn stage_names(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .map(|idx| self.graph[idx].name.as_str())
            .collect()
    }

    /// Generate Mermaid graph syntax for the workflow
    ///
    /// ```rust
    /// use chartflow::engine::graph::{Command, Stage, StateGraph};
    ///
    /// let mut graph = StateGraph::new();
    /// graph.add_stage(Stage::new("process").with_run(|_, _| Ok(Command::end())));
    /// graph.set_entry_point("process").unwrap();
    /// graph.add_simple_edge("process", "__end__").unwrap();
    ///
    /// let mermaid = graph.to_mermaid();
    /// assert!(mermaid.contains("graph TD"));
    /// assert!(mermaid.contains("__start__((Start))"));
    /// assert!(mermaid.contains("process[process]"));
    /// ```
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["graph TD".to_string()];

        fn escape_node_id(name: &str) -> String {
            name.chars()
                .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
                .collect()
        }

        fn escape_label(name: &str) -> String {
            name.replace('"', "'").replace('|', "/")
        }

        for name in self.stage_names() {
            let id = escape_node_id(name);
            match name {
                START => lines.push(format!("    {id}((Start))")),
                END => lines.push(format!("    {id}((End))")),
                _ => {
                    let stage = self.get_stage(name);
                    if stage.map_or(false, |s| s.interactive) {
                        lines.push(format!("    {id}{{{{{}}}}}", escape_label(name)));
                    } else {
                        lines.push(format!("    {id}[{}]", escape_label(name)));
                    }
                }
            }
        }

        for name in self.stage_names() {
            if let Some(description) = self.get_stage(name).and_then(|s| s.description.as_ref()) {
                lines.push(format!("    %% {}: {}", escape_node_id(name), description));
            }
        }

        for name in self.stage_names() {
            for (target, edge) in self.outgoing_edges(name) {
                let u = escape_node_id(name);
                let v = escape_node_id(target);
                match &edge.label {
                    Some(label) => lines.push(format!("    {u}-->|{}|{v}", escape_label(label))),
                    None => lines.push(format!("    {u}-->{v}")),
                }
            }
        }

        lines.join("\n")
    }

    fn index_of(&self, name: &str) -> FlowResult<NodeIndex> {
        self.node_indices
            .get(name)
            .copied()
            .ok_or_else(|| FlowError::NodeNotFound(name.to_string()))
    }
}

impl Default for StateGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateGraph")
            .field("name", &self.name)
            .field("node_count", &self.node_count())
            .field("edge_count", &self.edge_count())
            .field("entry_point", &self.entry_point)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

/// A validated graph ready for execution
#[must_use = "CompiledGraph should be passed to Executor for execution"]
pub struct CompiledGraph {
    graph: StateGraph,
}

impl CompiledGraph {
    pub fn graph(&self) -> &StateGraph {
        &self.graph
    }

    pub fn name(&self) -> &str {
        &self.graph.name
    }

    pub fn get_stage(&self, name: &str) -> Option<&Stage> {
        self.graph.get_stage(name)
    }

    pub fn entry_point(&self) -> &str {
        // validated at compile time
        self.graph.entry_point().unwrap_or(END)
    }

    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        self.graph.can_transition(from, to)
    }

    pub fn max_steps(&self) -> usize {
        self.graph.max_steps()
    }

    pub fn to_mermaid(&self) -> String {
        self.graph.to_mermaid()
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("graph", &self.graph)
            .finish()
    }
}
