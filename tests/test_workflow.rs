//! Integration tests for the conversation workflow

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

use chartflow::engine::executor::EventType;
use chartflow::engine::interrupt::{InterruptContext, ResumeToken};
use chartflow::engine::state::{DatasetRef, WorkflowState};
use chartflow::services::fixtures::{
    FailingService, Fixtures, FIXTURE_CAPTION, FIXTURE_SQL, FIXTURE_SUMMARY,
};
use chartflow::services::{ArtifactPaths, ChartGenerator, Services};
use chartflow::workflow::{
    build_workflow, stages, WorkflowMode, CONFIRM_DATA, CONFIRM_SQL, DATA_QUERY_PROMPT,
};
use chartflow::{Executor, FlowError, FlowResult, RunOutcome, TurnInput, TurnStatus};

struct Harness {
    _dir: TempDir,
    fixtures: Fixtures,
    executor: Executor,
}

fn harness(mode: WorkflowMode) -> Harness {
    let dir = tempdir().unwrap();
    let fixtures = Fixtures::new();
    let services = Arc::new(fixtures.services(dir.path()));
    let executor = Executor::in_memory(build_workflow(services, mode).unwrap());
    Harness {
        _dir: dir,
        fixtures,
        executor,
    }
}

fn harness_with(services: Services, mode: WorkflowMode) -> Executor {
    Executor::in_memory(build_workflow(Arc::new(services), mode).unwrap())
}

fn stage_of(outcome: &RunOutcome) -> Option<&str> {
    outcome.interrupt().map(|i| i.stage.as_str())
}

/// Drive a conversation up to the refinement prompt of the first turn
fn reach_refinement(executor: &Executor, conversation: &str, query: &str) -> RunOutcome {
    let outcome = executor.invoke(conversation, query).unwrap();
    assert_eq!(stage_of(&outcome), Some(CONFIRM_SQL));
    let outcome = executor.resume(conversation, "yes").unwrap();
    assert_eq!(stage_of(&outcome), Some(CONFIRM_DATA));
    let outcome = executor.resume(conversation, "y").unwrap();
    assert_eq!(stage_of(&outcome), Some(DATA_QUERY_PROMPT));
    outcome
}

// ============================================================================
// Full turn
// ============================================================================

#[test]
fn test_full_hitl_turn() {
    let h = harness(WorkflowMode::Hitl);
    let conv = "sales";

    let outcome = h.executor.invoke(conv, "compare sales by category").unwrap();
    let interrupt = outcome.interrupt().unwrap();
    assert_eq!(interrupt.stage, CONFIRM_SQL);
    assert!(interrupt.prompt.contains(FIXTURE_SQL));
    assert!(!outcome.state().sql_query.is_empty());

    let outcome = h.executor.resume(conv, "yes").unwrap();
    assert_eq!(stage_of(&outcome), Some(CONFIRM_DATA));
    let dataset = outcome.state().dataset.clone().unwrap();
    assert!(!dataset.columns.is_empty());
    assert!(outcome.interrupt().unwrap().prompt.contains("Clothing"));

    let outcome = h.executor.resume(conv, "y").unwrap();
    assert_eq!(stage_of(&outcome), Some(DATA_QUERY_PROMPT));
    assert!(outcome.state().chart.is_none());

    let outcome = h.executor.resume(conv, "").unwrap();
    // summarize loops back to the refinement prompt
    assert_eq!(stage_of(&outcome), Some(DATA_QUERY_PROMPT));

    let state = outcome.state();
    assert_eq!(state.data_query, "compare sales by category");
    let chart = state.chart.as_ref().unwrap();
    assert!(chart.path.is_file());
    assert_eq!(chart.caption, FIXTURE_CAPTION);
    assert_eq!(state.summary, FIXTURE_SUMMARY);
}

#[test]
fn test_direct_mode_runs_without_interrupts() {
    let h = harness(WorkflowMode::Direct);

    let execution = h
        .executor
        .execute("direct", TurnInput::Query("show category counts".into()))
        .unwrap();

    assert!(!execution.outcome.is_interrupted());
    let state = execution.outcome.state();
    assert_eq!(state.sql_query, FIXTURE_SQL);
    assert!(state.chart.as_ref().unwrap().path.is_file());
    assert!(!state.summary.is_empty());

    assert!(execution
        .events
        .iter()
        .all(|e| e.event_type != EventType::Interrupt));
    assert_eq!(execution.events.last().unwrap().event_type, EventType::Finish);
    assert_eq!(h.fixtures.total_calls(), 4);
}

// ============================================================================
// Rejection and quitting
// ============================================================================

#[test]
fn test_reject_sql_ends_turn_without_more_calls() {
    let h = harness(WorkflowMode::Hitl);

    h.executor.invoke("c1", "show category counts").unwrap();
    assert_eq!(h.fixtures.total_calls(), 1);

    let outcome = h.executor.resume("c1", "no").unwrap();
    assert!(!outcome.is_interrupted());
    assert!(outcome.state().dataset.is_none());
    assert_eq!(h.fixtures.total_calls(), 1);

    let snapshot = h.executor.get_state("c1").unwrap().unwrap();
    assert_eq!(snapshot.status, TurnStatus::Completed);
    assert!(snapshot.interrupt.is_none());
}

#[test]
fn test_reject_data_leaves_chart_and_summary_unset() {
    let h = harness(WorkflowMode::Hitl);

    h.executor.invoke("c1", "compare sales by category").unwrap();
    h.executor.resume("c1", "yes").unwrap();
    let calls = h.fixtures.total_calls();

    let outcome = h.executor.resume("c1", "no").unwrap();
    assert!(!outcome.is_interrupted());
    assert!(outcome.state().chart.is_none());
    assert!(outcome.state().summary.is_empty());
    assert_eq!(h.fixtures.total_calls(), calls);
    assert_eq!(h.fixtures.chart_generator.calls(), 0);
}

#[test]
fn test_anything_outside_the_approval_set_rejects() {
    for answer in ["nah", "yes please", "ok", ""] {
        let h = harness(WorkflowMode::Hitl);
        h.executor.invoke("c1", "q").unwrap();
        let outcome = h.executor.resume("c1", answer).unwrap();
        assert!(!outcome.is_interrupted(), "{answer:?} should reject");
    }
}

#[test]
fn test_quit_keywords_end_before_plot() {
    for keyword in ["quit", "Stop", "END", " finish "] {
        let h = harness(WorkflowMode::Hitl);
        reach_refinement(&h.executor, "c1", "show category counts");

        let outcome = h.executor.resume("c1", keyword).unwrap();
        assert!(!outcome.is_interrupted(), "{keyword:?} should end the turn");
        assert_eq!(h.fixtures.chart_generator.calls(), 0);
    }
}

// ============================================================================
// Refinement loop
// ============================================================================

#[test]
fn test_empty_refinement_reuses_user_query() {
    let h = harness(WorkflowMode::Hitl);
    reach_refinement(&h.executor, "c1", "show category counts");

    let outcome = h.executor.resume("c1", "").unwrap();
    assert_eq!(outcome.state().data_query, "show category counts");
}

#[test]
fn test_refinement_replots_with_new_instruction() {
    let h = harness(WorkflowMode::Hitl);
    reach_refinement(&h.executor, "c1", "show category counts");

    h.executor.resume("c1", "").unwrap();
    let outcome = h.executor.resume("c1", "make it a pie chart").unwrap();

    assert_eq!(stage_of(&outcome), Some(DATA_QUERY_PROMPT));
    assert_eq!(outcome.state().data_query, "make it a pie chart");
    assert_eq!(outcome.state().user_query, "show category counts");
    assert_eq!(h.fixtures.chart_generator.calls(), 2);
    assert_eq!(h.fixtures.sql_generator.calls(), 1);
}

#[test]
fn test_new_turn_clears_previous_outputs() {
    let h = harness(WorkflowMode::Hitl);
    reach_refinement(&h.executor, "c1", "show category counts");
    h.executor.resume("c1", "").unwrap();

    // A new question while the refinement prompt is pending starts over
    let outcome = h.executor.invoke("c1", "top customers").unwrap();
    assert_eq!(stage_of(&outcome), Some(CONFIRM_SQL));

    let state = outcome.state();
    assert_eq!(state.conversation_id, "c1");
    assert_eq!(state.user_query, "top customers");
    assert_eq!(state.data_query, "top customers");
    assert!(state.dataset.is_none());
    assert!(state.chart.is_none());
    assert!(state.summary.is_empty());
}

// ============================================================================
// Resume protocol
// ============================================================================

#[test]
fn test_resume_without_pending_interrupt_fails() {
    let h = harness(WorkflowMode::Hitl);

    let err = h.executor.resume("unknown", "yes").unwrap_err();
    assert!(matches!(err, FlowError::InvalidResume(_)));

    h.executor.invoke("c1", "q").unwrap();
    h.executor.resume("c1", "no").unwrap();
    let err = h.executor.resume("c1", "yes").unwrap_err();
    assert!(matches!(err, FlowError::InvalidResume(_)));
}

#[test]
fn test_state_names_the_suspended_stage() {
    let h = harness(WorkflowMode::Hitl);
    h.executor.invoke("c1", "q").unwrap();

    let snapshot = h.executor.get_state("c1").unwrap().unwrap();
    assert_eq!(snapshot.status, TurnStatus::Interrupted);
    assert_eq!(snapshot.next.as_deref(), Some(CONFIRM_SQL));
    assert_eq!(snapshot.interrupt.unwrap().stage, CONFIRM_SQL);
    assert_eq!(snapshot.values.sql_query, FIXTURE_SQL);

    assert!(h.executor.get_state("other").unwrap().is_none());
}

#[test]
fn test_resume_matches_synchronous_answers() {
    let dir = tempdir().unwrap();
    let services = Fixtures::new().services(dir.path());

    // Suspend and resume through the executor
    let executor = harness_with(services.clone(), WorkflowMode::Hitl);
    reach_refinement(&executor, "replay", "show category counts");
    let resumed = executor.resume("replay", "bar chart").unwrap().into_state();

    // Same answers handed to the stages up front
    let answered = |stage: &str, answer: &str| {
        InterruptContext::replay(&ResumeToken::new(stage).with_answer(answer))
    };
    let mode = WorkflowMode::Hitl;
    let mut state = WorkflowState::new("replay");
    state.begin_turn("show category counts");

    let steps: Vec<Box<dyn Fn(&WorkflowState) -> FlowResult<chartflow::Command>>> = vec![
        Box::new(|s: &WorkflowState| stages::sql_generate(&services, mode, s)),
        Box::new(|s: &WorkflowState| stages::confirm_sql(s, &mut answered(CONFIRM_SQL, "yes"))),
        Box::new(|s: &WorkflowState| stages::extract_data(&services, mode, s)),
        Box::new(|s: &WorkflowState| stages::confirm_data(s, &mut answered(CONFIRM_DATA, "y"))),
        Box::new(|s: &WorkflowState| {
            stages::data_query_prompt(s, &mut answered(DATA_QUERY_PROMPT, "bar chart"))
        }),
        Box::new(|s: &WorkflowState| stages::plot(&services, s)),
        Box::new(|s: &WorkflowState| stages::summarize(&services, mode, s)),
    ];
    for step in steps {
        let command = step(&state).unwrap();
        state.apply(command.update);
    }

    assert_eq!(resumed, state);
}

#[test]
fn test_checkpoint_steps_are_monotonic() {
    let h = harness(WorkflowMode::Hitl);
    reach_refinement(&h.executor, "c1", "q");
    h.executor.resume("c1", "").unwrap();

    let history = h.executor.checkpointer().history("c1").unwrap();
    assert!(history.len() >= 6);
    assert!(history.windows(2).all(|w| w[0].step < w[1].step));
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_empty_question_is_rejected() {
    let h = harness(WorkflowMode::Hitl);

    let err = h.executor.invoke("c1", "   ").unwrap_err();
    assert!(matches!(err, FlowError::Precondition { .. }));
    assert_eq!(err.user_message(), "Query can't be empty");
    assert_eq!(h.fixtures.total_calls(), 0);
}

#[test]
fn test_service_failure_aborts_turn_but_not_conversation() {
    let dir = tempdir().unwrap();
    let mut services = Fixtures::new().services(dir.path());
    services.extractor = Arc::new(FailingService::new("503 database unavailable"));
    let executor = harness_with(services, WorkflowMode::Hitl);

    executor.invoke("c1", "q").unwrap();
    let err = executor.resume("c1", "yes").unwrap_err();
    assert!(matches!(err, FlowError::Service { .. }));
    assert_eq!(err.user_message(), "Something went wrong with the request.");

    let snapshot = executor.get_state("c1").unwrap().unwrap();
    assert_eq!(snapshot.status, TurnStatus::Aborted);
    assert!(snapshot.interrupt.is_none());

    // No pending prompt survives the abort
    assert!(matches!(
        executor.resume("c1", "yes").unwrap_err(),
        FlowError::InvalidResume(_)
    ));

    // A new turn still works
    let outcome = executor.invoke("c1", "another question").unwrap();
    assert_eq!(stage_of(&outcome), Some(CONFIRM_SQL));
}

/// Reports a chart path without writing anything there
struct FixedPathChart(PathBuf);

impl ChartGenerator for FixedPathChart {
    fn generate(
        &self,
        _dataset: &DatasetRef,
        _instruction: &str,
        _artifacts: &ArtifactPaths,
    ) -> FlowResult<PathBuf> {
        Ok(self.0.clone())
    }
}

fn direct_with_chart(dir: &Path, chart: PathBuf) -> (Fixtures, Executor) {
    let fixtures = Fixtures::new();
    let mut services = fixtures.services(dir);
    services.chart_generator = Arc::new(FixedPathChart(chart));
    (fixtures, harness_with(services, WorkflowMode::Direct))
}

#[test]
fn test_missing_chart_file_fails_before_summary() {
    let dir = tempdir().unwrap();
    let (fixtures, executor) = direct_with_chart(dir.path(), dir.path().join("nowhere.png"));

    let err = executor.invoke("c1", "q").unwrap_err();
    assert!(matches!(err, FlowError::MissingResource(_)));
    assert_eq!(fixtures.summarizer.calls(), 0);
}

#[test]
fn test_directory_chart_path_fails_before_summary() {
    let dir = tempdir().unwrap();
    let (fixtures, executor) = direct_with_chart(dir.path(), dir.path().to_path_buf());

    let err = executor.invoke("c1", "q").unwrap_err();
    assert!(matches!(err, FlowError::NotAFile(_)));
    assert_eq!(fixtures.summarizer.calls(), 0);
}

#[test]
fn test_step_bound_applies_per_invocation() {
    let dir = tempdir().unwrap();
    let services = Arc::new(Fixtures::new().services(dir.path()));
    let graph =
        chartflow::workflow::build_workflow_with_max_steps(services, WorkflowMode::Hitl, 2)
            .unwrap();
    let executor = Executor::in_memory(graph);

    // sql_generate and confirm_sql fit in the bound
    executor.invoke("c1", "q").unwrap();

    // confirm_sql, extract_data, then confirm_data would be the third stage
    let err = executor.resume("c1", "yes").unwrap_err();
    assert!(matches!(err, FlowError::MaxStepsExceeded(2)));
}

#[test]
fn test_path_like_conversation_ids_are_rejected() {
    let dir = tempdir().unwrap();
    let artifacts = dir.path().join("inner");
    let fixtures = Fixtures::new();
    let executor = harness_with(fixtures.services(&artifacts), WorkflowMode::Hitl);

    for id in ["a/../../escaped", "team/42", "..", "c 1"] {
        let err = executor.invoke(id, "show category counts").unwrap_err();
        assert!(matches!(err, FlowError::Precondition { .. }), "{id}: {err:?}");
        assert!(executor.get_state(id).unwrap().is_none());
    }

    assert_eq!(fixtures.total_calls(), 0);
    assert!(!dir.path().join("escaped.json").exists());
    assert!(!artifacts.exists());
}

#[test]
fn test_artifact_write_failure_is_a_resource_error() {
    let dir = tempdir().unwrap();
    // a regular file where the artifact directory should be
    let blocked = dir.path().join("artifacts");
    std::fs::write(&blocked, b"not a directory").unwrap();
    let executor = harness_with(Fixtures::new().services(&blocked), WorkflowMode::Direct);

    let err = executor.invoke("c1", "q").unwrap_err();
    assert!(matches!(err, FlowError::InaccessibleResource { .. }), "{err:?}");
    assert!(err.is_turn_fatal());
    let snapshot = executor.get_state("c1").unwrap().unwrap();
    assert_eq!(snapshot.status, TurnStatus::Aborted);
}
