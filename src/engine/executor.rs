//! Graph executor: runs stages, handles interrupts, saves checkpoints
//!
//! Handles the actual execution of compiled graphs, including:
//! - Sequential stage execution with declared-transition checks
//! - Suspension on interrupt and replay-based resumption
//! - A checkpoint after every completed stage

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::checkpoint::{
    is_valid_conversation_id, Checkpoint, Checkpointer, MemoryCheckpointer, PendingInterrupt,
    TurnStatus,
};
use crate::engine::graph::CompiledGraph;
use crate::engine::interrupt::{Interrupt, InterruptContext, ResumeToken};
use crate::engine::state::WorkflowState;
use crate::error::{FlowError, FlowResult};
use crate::{END, START};

/// Execution event emitted during graph traversal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Stage the event refers to
    pub stage: String,

    /// State when the event was emitted
    pub state: WorkflowState,

    pub event_type: EventType,

    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Duration in milliseconds
    #[serde(default)]
    pub duration_ms: Option<f64>,

    #[serde(default)]
    pub error: Option<String>,

    /// Prompt of an interrupt event
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Type of execution event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Stage execution started
    Start,
    /// Stage execution completed
    Complete,
    /// Stage execution failed
    Error,
    /// Stage suspended for human input
    Interrupt,
    /// Turn reached END
    Finish,
}

impl ExecutionEvent {
    pub fn new(stage: impl Into<String>, state: &WorkflowState, event_type: EventType) -> Self {
        Self {
            stage: stage.into(),
            state: state.clone(),
            event_type,
            timestamp: chrono::Utc::now(),
            duration_ms: None,
            error: None,
            prompt: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Input of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnInput {
    /// Start a new turn with a natural-language question
    Query(String),
    /// Answer the pending interrupt
    Resume(String),
}

/// How an invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The turn reached END
    Completed { state: WorkflowState },
    /// A stage is waiting for human input
    Interrupted {
        interrupt: Interrupt,
        state: WorkflowState,
    },
}

impl RunOutcome {
    pub fn state(&self) -> &WorkflowState {
        match self {
            RunOutcome::Completed { state } | RunOutcome::Interrupted { state, .. } => state,
        }
    }

    pub fn interrupt(&self) -> Option<&Interrupt> {
        match self {
            RunOutcome::Interrupted { interrupt, .. } => Some(interrupt),
            RunOutcome::Completed { .. } => None,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunOutcome::Interrupted { .. })
    }

    pub fn into_state(self) -> WorkflowState {
        match self {
            RunOutcome::Completed { state } | RunOutcome::Interrupted { state, .. } => state,
        }
    }
}

/// Outcome plus the events produced on the way
#[derive(Debug, Clone)]
pub struct Execution {
    pub outcome: RunOutcome,
    pub events: Vec<ExecutionEvent>,
}

/// What the caller can learn about a conversation between invocations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub values: WorkflowState,

    /// Stage that runs next, the suspended stage while interrupted
    pub next: Option<String>,

    pub status: TurnStatus,

    pub interrupt: Option<Interrupt>,

    /// Answers already given to earlier prompts of the suspended stage
    #[serde(default)]
    pub answers: Vec<String>,

    pub step: u64,

    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Checkpoint> for StateSnapshot {
    fn from(checkpoint: Checkpoint) -> Self {
        let (interrupt, answers) = match checkpoint.pending {
            Some(pending) => (Some(pending.interrupt), pending.answers),
            None => (None, Vec::new()),
        };
        Self {
            values: checkpoint.state,
            next: checkpoint.next_stage,
            status: checkpoint.status,
            interrupt,
            answers,
            step: checkpoint.step,
            created_at: checkpoint.created_at,
        }
    }
}

/// Graph executor
pub struct Executor {
    graph: Arc<CompiledGraph>,
    checkpointer: Arc<dyn Checkpointer>,
}

impl Executor {
    /// Create an executor persisting through `checkpointer`
    pub fn new(graph: CompiledGraph, checkpointer: Arc<dyn Checkpointer>) -> Self {
        Self {
            graph: Arc::new(graph),
            checkpointer,
        }
    }

    /// Executor backed by a process-lifetime checkpointer
    pub fn in_memory(graph: CompiledGraph) -> Self {
        Self::new(graph, Arc::new(MemoryCheckpointer::new()))
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn checkpointer(&self) -> &Arc<dyn Checkpointer> {
        &self.checkpointer
    }

    /// Start a new turn
    pub fn invoke(&self, conversation_id: &str, user_query: &str) -> FlowResult<RunOutcome> {
        self.execute(conversation_id, TurnInput::Query(user_query.to_string()))
            .map(|e| e.outcome)
    }

    /// Answer the pending interrupt of a conversation
    pub fn resume(&self, conversation_id: &str, answer: &str) -> FlowResult<RunOutcome> {
        self.execute(conversation_id, TurnInput::Resume(answer.to_string()))
            .map(|e| e.outcome)
    }

    /// Execute and return the events of the invocation
    pub fn stream(
        &self,
        conversation_id: &str,
        input: TurnInput,
    ) -> FlowResult<impl Iterator<Item = ExecutionEvent>> {
        Ok(self.execute(conversation_id, input)?.events.into_iter())
    }

    /// Latest snapshot of a conversation
    pub fn get_state(&self, conversation_id: &str) -> FlowResult<Option<StateSnapshot>> {
        Ok(self
            .checkpointer
            .load(conversation_id)?
            .map(StateSnapshot::from))
    }

    /// Forget a conversation
    pub fn reset(&self, conversation_id: &str) -> FlowResult<()> {
        self.checkpointer.delete(conversation_id)
    }

    /// Execute with full results
    pub fn execute(&self, conversation_id: &str, input: TurnInput) -> FlowResult<Execution> {
        if conversation_id.trim().is_empty() {
            return Err(FlowError::precondition(START, "conversation id is empty"));
        }
        if !is_valid_conversation_id(conversation_id) {
            return Err(FlowError::precondition(
                START,
                format!(
                    "invalid conversation id '{conversation_id}': \
                     use ASCII letters, digits, '-' or '_'"
                ),
            ));
        }

        let previous = self.checkpointer.load(conversation_id)?;
        let step = previous.as_ref().map_or(0, |c| c.step + 1);

        match input {
            TurnInput::Query(query) => {
                let mut state = previous
                    .map(|c| c.state)
                    .unwrap_or_else(|| WorkflowState::new(conversation_id));
                state.conversation_id = conversation_id.to_string();
                state.begin_turn(query);

                info!(
                    conversation = conversation_id,
                    graph = self.graph.name(),
                    "starting turn"
                );
                let entry = self.graph.entry_point().to_string();
                self.run(state, entry, None, step)
            }
            TurnInput::Resume(answer) => {
                let checkpoint = previous
                    .ok_or_else(|| FlowError::InvalidResume(conversation_id.to_string()))?;

                let pending = match (checkpoint.status, checkpoint.pending) {
                    (TurnStatus::Interrupted, Some(pending)) => pending,
                    _ => return Err(FlowError::InvalidResume(conversation_id.to_string())),
                };

                info!(
                    conversation = conversation_id,
                    stage = %pending.interrupt.stage,
                    "resuming"
                );
                let token = pending.resume_with(answer);
                let stage = token.stage.clone();
                self.run(checkpoint.state, stage, Some(token), step)
            }
        }
    }

    /// Main execution loop
    fn run(
        &self,
        mut state: WorkflowState,
        mut current: String,
        mut token: Option<ResumeToken>,
        mut step: u64,
    ) -> FlowResult<Execution> {
        let mut events = Vec::new();
        let max_steps = self.graph.max_steps();
        let mut executed = 0usize;

        loop {
            if current == END {
                self.save(
                    Checkpoint::new(state.clone(), None, TurnStatus::Completed),
                    &mut step,
                )?;
                events.push(ExecutionEvent::new(END, &state, EventType::Finish));
                info!(conversation = %state.conversation_id, "turn completed");
                return Ok(Execution {
                    outcome: RunOutcome::Completed { state },
                    events,
                });
            }

            executed += 1;
            if executed > max_steps {
                let err = FlowError::MaxStepsExceeded(max_steps);
                self.abort(&state, &current, &err, &mut step);
                return Err(err);
            }

            let stage = self
                .graph
                .get_stage(&current)
                .ok_or_else(|| FlowError::NodeNotFound(current.clone()))?;
            let run = stage.run.clone().ok_or_else(|| FlowError::Execution {
                stage: current.clone(),
                message: "stage has no run function".to_string(),
            })?;

            let mut ctx = match token.take() {
                Some(t) if t.stage == current => InterruptContext::replay(&t),
                _ => InterruptContext::new(current.as_str()),
            };

            debug!(stage = %current, "running stage");
            events.push(ExecutionEvent::new(&current, &state, EventType::Start));
            let started = Instant::now();

            match run(&state, &mut ctx) {
                Ok(command) => {
                    let target = command.goto.name().to_string();
                    if !self.graph.can_transition(&current, &target) {
                        let err = FlowError::InvalidTransition {
                            from: current.clone(),
                            to: target,
                        };
                        events.push(
                            ExecutionEvent::new(&current, &state, EventType::Error)
                                .with_error(err.to_string()),
                        );
                        self.abort(&state, &current, &err, &mut step);
                        return Err(err);
                    }

                    state.apply(command.update);
                    let duration = started.elapsed().as_secs_f64() * 1000.0;
                    events.push(
                        ExecutionEvent::new(&current, &state, EventType::Complete)
                            .with_duration(duration),
                    );
                    debug!(
                        stage = %current,
                        next = %target,
                        duration_ms = duration,
                        "stage completed"
                    );

                    if target != END {
                        self.save(
                            Checkpoint::new(
                                state.clone(),
                                Some(target.clone()),
                                TurnStatus::Running,
                            ),
                            &mut step,
                        )?;
                    }
                    current = target;
                }
                Err(FlowError::Interrupted(interrupt)) => {
                    let pending = PendingInterrupt {
                        interrupt: interrupt.clone(),
                        answers: ctx.consumed().to_vec(),
                    };
                    self.save(
                        Checkpoint::new(
                            state.clone(),
                            Some(current.clone()),
                            TurnStatus::Interrupted,
                        )
                        .with_pending(pending),
                        &mut step,
                    )?;
                    events.push(
                        ExecutionEvent::new(&current, &state, EventType::Interrupt)
                            .with_prompt(&interrupt.prompt),
                    );
                    info!(
                        conversation = %state.conversation_id,
                        stage = %current,
                        "waiting for human input"
                    );
                    return Ok(Execution {
                        outcome: RunOutcome::Interrupted { interrupt, state },
                        events,
                    });
                }
                Err(err) => {
                    events.push(
                        ExecutionEvent::new(&current, &state, EventType::Error)
                            .with_error(err.to_string()),
                    );
                    self.abort(&state, &current, &err, &mut step);
                    return Err(err);
                }
            }
        }
    }

    fn save(&self, checkpoint: Checkpoint, step: &mut u64) -> FlowResult<()> {
        self.checkpointer.save(&checkpoint.with_step(*step))?;
        *step += 1;
        Ok(())
    }

    /// Record an aborted turn; the original error wins over a failed save
    fn abort(&self, state: &WorkflowState, stage: &str, err: &FlowError, step: &mut u64) {
        warn!(
            conversation = %state.conversation_id,
            stage,
            error = %err,
            "turn aborted"
        );
        let checkpoint = Checkpoint::new(state.clone(), None, TurnStatus::Aborted)
            .with_metadata(serde_json::json!({
                "stage": stage,
                "error": err.to_string(),
            }));
        if let Err(save_err) = self.save(checkpoint, step) {
            warn!(error = %save_err, "failed to checkpoint aborted turn");
        }
    }
}
