//! Stage functions of the conversation graph
//!
//! Every stage reads the state, optionally calls one service or asks the
//! human one question, and returns the fields it replaces plus where to go
//! next. None of them mutates the state directly.

use tracing::debug;

use crate::engine::graph::Command;
use crate::engine::interrupt::InterruptContext;
use crate::engine::state::{read_resource, ChartRef, StateUpdate, WorkflowState};
use crate::error::{FlowError, FlowResult};
use crate::services::Services;
use crate::workflow::{
    is_approval, is_quit, WorkflowMode, CONFIRM_DATA, CONFIRM_SQL, DATA_QUERY_PROMPT,
    EXTRACT_DATA, PLOT, SQL_GENERATE, SUMMARIZE,
};

/// Prompt shown at `confirm_sql`
pub fn confirm_sql_prompt(sql: &str) -> String {
    format!("Generated SQL query:\n{}\nDo you want to continue? (yes/no)", sql)
}

/// Prompt shown at `confirm_data`
pub fn confirm_data_prompt(table: &str) -> String {
    format!(
        "First rows of the data:\n```\n{}```\nDo you want to continue? (yes/no)",
        table
    )
}

/// Prompt shown at `data_query_prompt`
pub fn data_query_prompt_text(user_query: &str) -> String {
    format!(
        "Write instructions for the data plot. Leave empty for original query: `{}`\nType 'quit' or 'stop' to exit.",
        user_query
    )
}

/// Instruction for plotting and summarizing: the refinement, else the question
fn instruction(state: &WorkflowState) -> &str {
    if state.data_query.trim().is_empty() {
        &state.user_query
    } else {
        &state.data_query
    }
}

pub fn sql_generate(
    services: &Services,
    mode: WorkflowMode,
    state: &WorkflowState,
) -> FlowResult<Command> {
    let query = state.require_user_query(SQL_GENERATE)?;

    let sql = services
        .sql_generator
        .generate(query, &services.schema, &services.engine)?;
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(FlowError::service("sql generation", "generated SQL is empty"));
    }

    debug!(sql, "generated SQL");
    Ok(Command::goto(mode.after_sql()).with_update(StateUpdate::new().sql_query(sql)))
}

pub fn confirm_sql(state: &WorkflowState, ctx: &mut InterruptContext) -> FlowResult<Command> {
    let answer = ctx.interrupt(confirm_sql_prompt(&state.sql_query))?;

    if is_approval(&answer) {
        Ok(Command::goto(EXTRACT_DATA))
    } else {
        debug!(stage = CONFIRM_SQL, "SQL rejected");
        Ok(Command::end())
    }
}

pub fn extract_data(
    services: &Services,
    mode: WorkflowMode,
    state: &WorkflowState,
) -> FlowResult<Command> {
    let sql = state.require_sql(EXTRACT_DATA)?;

    let artifacts = services.artifacts(&state.conversation_id);
    let dataset = services.extractor.extract(sql, &artifacts)?;
    if dataset.columns.is_empty() {
        return Err(FlowError::service("sql execution", "query returned no columns"));
    }

    debug!(path = %dataset.path.display(), columns = dataset.columns.len(), "dataset extracted");
    Ok(Command::goto(mode.after_extract()).with_update(StateUpdate::new().dataset(Some(dataset))))
}

pub fn confirm_data(state: &WorkflowState, ctx: &mut InterruptContext) -> FlowResult<Command> {
    let dataset = state
        .dataset
        .as_ref()
        .ok_or_else(|| FlowError::precondition(CONFIRM_DATA, "no dataset has been extracted"))?;

    let answer = ctx.interrupt(confirm_data_prompt(&dataset.render_preview()))?;

    if is_approval(&answer) {
        Ok(Command::goto(DATA_QUERY_PROMPT))
    } else {
        debug!(stage = CONFIRM_DATA, "data rejected");
        Ok(Command::end())
    }
}

pub fn data_query_prompt(
    state: &WorkflowState,
    ctx: &mut InterruptContext,
) -> FlowResult<Command> {
    let answer = ctx.interrupt(data_query_prompt_text(&state.user_query))?;
    let answer = answer.trim();

    if is_quit(answer) {
        return Ok(Command::end());
    }

    // Blank refinement reuses the original question
    let data_query = if answer.is_empty() {
        state.user_query.clone()
    } else {
        answer.to_string()
    };

    Ok(Command::goto(PLOT).with_update(
        StateUpdate::new()
            .data_query(data_query)
            .chart(None)
            .summary(""),
    ))
}

pub fn plot(services: &Services, state: &WorkflowState) -> FlowResult<Command> {
    let dataset = state.require_dataset(PLOT)?;

    let artifacts = services.artifacts(&state.conversation_id);
    let path = services
        .chart_generator
        .generate(dataset, instruction(state), &artifacts)?;

    debug!(path = %path.display(), "chart rendered");
    Ok(Command::goto(SUMMARIZE).with_update(StateUpdate::new().chart(Some(ChartRef::new(path)))))
}

pub fn summarize(
    services: &Services,
    mode: WorkflowMode,
    state: &WorkflowState,
) -> FlowResult<Command> {
    let chart = state.require_chart_file(SUMMARIZE)?;
    let image = read_resource(&chart.path)?;

    let result = services.summarizer.summarize(&image, instruction(state))?;

    let chart = ChartRef {
        path: chart.path.clone(),
        caption: result.caption,
    };
    Ok(Command::goto(mode.after_summary()).with_update(
        StateUpdate::new()
            .summary(result.summary)
            .chart(Some(chart)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::graph::Goto;
    use crate::engine::state::DatasetRef;
    use crate::services::fixtures::{fixture_services, FIXTURE_CAPTION, FIXTURE_SQL};
    use std::fs;
    use tempfile::tempdir;

    fn answered(stage: &str, answer: &str) -> InterruptContext {
        InterruptContext::replay(
            &crate::engine::interrupt::ResumeToken::new(stage).with_answer(answer),
        )
    }

    // =========================================================================
    // Service stages
    // =========================================================================

    #[test]
    fn test_sql_generate_requires_query() {
        let services = fixture_services(std::env::temp_dir());
        let state = WorkflowState::new("c1");

        let err = sql_generate(&services, WorkflowMode::Hitl, &state).unwrap_err();
        assert!(matches!(err, FlowError::Precondition { .. }));
    }

    #[test]
    fn test_sql_generate_routes_by_mode() {
        let services = fixture_services(std::env::temp_dir());
        let mut state = WorkflowState::new("c1");
        state.begin_turn("show category counts");

        let cmd = sql_generate(&services, WorkflowMode::Hitl, &state).unwrap();
        assert_eq!(cmd.goto, Goto::Stage(CONFIRM_SQL.to_string()));
        assert_eq!(cmd.update.sql_query.as_deref(), Some(FIXTURE_SQL));

        let cmd = sql_generate(&services, WorkflowMode::Direct, &state).unwrap();
        assert_eq!(cmd.goto, Goto::Stage(EXTRACT_DATA.to_string()));
    }

    #[test]
    fn test_extract_data_rejects_empty_sql() {
        let services = fixture_services(std::env::temp_dir());
        let state = WorkflowState::new("c1");

        let err = extract_data(&services, WorkflowMode::Hitl, &state).unwrap_err();
        match err {
            FlowError::Precondition { stage, message } => {
                assert_eq!(stage, EXTRACT_DATA);
                assert_eq!(message, "SQL query is empty");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_plot_requires_existing_dataset() {
        let dir = tempdir().unwrap();
        let services = fixture_services(dir.path());
        let mut state = WorkflowState::new("c1");
        state.dataset = Some(DatasetRef::new(dir.path().join("gone.json"), vec!["a".into()]));

        let err = plot(&services, &state).unwrap_err();
        assert!(matches!(err, FlowError::MissingResource(_)));
    }

    #[test]
    fn test_summarize_rejects_directory_chart() {
        let dir = tempdir().unwrap();
        let services = fixture_services(dir.path());
        let mut state = WorkflowState::new("c1");
        state.chart = Some(ChartRef::new(dir.path()));

        let err = summarize(&services, WorkflowMode::Hitl, &state).unwrap_err();
        assert!(matches!(err, FlowError::NotAFile(_)));
    }

    #[test]
    fn test_summarize_sets_caption_and_loops() {
        let dir = tempdir().unwrap();
        let services = fixture_services(dir.path());
        let chart_path = dir.path().join("plot_c1.png");
        fs::write(&chart_path, b"png").unwrap();

        let mut state = WorkflowState::new("c1");
        state.begin_turn("show category counts");
        state.chart = Some(ChartRef::new(&chart_path));

        let cmd = summarize(&services, WorkflowMode::Hitl, &state).unwrap();
        assert_eq!(cmd.goto, Goto::Stage(DATA_QUERY_PROMPT.to_string()));

        state.apply(cmd.update);
        assert!(!state.summary.is_empty());
        assert_eq!(state.chart.unwrap().caption, FIXTURE_CAPTION);

        let mut state = WorkflowState::new("c1");
        state.chart = Some(ChartRef::new(&chart_path));
        let cmd = summarize(&services, WorkflowMode::Direct, &state).unwrap();
        assert_eq!(cmd.goto, Goto::End);
    }

    // =========================================================================
    // Human stages
    // =========================================================================

    #[test]
    fn test_confirm_sql_prompt_and_decisions() {
        let mut state = WorkflowState::new("c1");
        state.sql_query = "SELECT 1".to_string();

        let err = confirm_sql(&state, &mut InterruptContext::new(CONFIRM_SQL)).unwrap_err();
        match err {
            FlowError::Interrupted(interrupt) => {
                assert_eq!(interrupt.stage, CONFIRM_SQL);
                assert_eq!(
                    interrupt.prompt,
                    "Generated SQL query:\nSELECT 1\nDo you want to continue? (yes/no)"
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let cmd = confirm_sql(&state, &mut answered(CONFIRM_SQL, " Yeah ")).unwrap();
        assert_eq!(cmd.goto, Goto::Stage(EXTRACT_DATA.to_string()));

        let cmd = confirm_sql(&state, &mut answered(CONFIRM_SQL, "nope")).unwrap();
        assert_eq!(cmd.goto, Goto::End);
        assert!(cmd.update.is_empty());
    }

    #[test]
    fn test_confirm_data_shows_preview() {
        let mut state = WorkflowState::new("c1");
        state.dataset = Some(
            DatasetRef::new("/tmp/data_c1.json", vec!["category".into(), "n".into()])
                .with_preview(vec![vec!["Clothing".into(), "3".into()]]),
        );

        let err = confirm_data(&state, &mut InterruptContext::new(CONFIRM_DATA)).unwrap_err();
        match err {
            FlowError::Interrupted(interrupt) => {
                assert!(interrupt.prompt.contains("Clothing"));
                assert!(interrupt.prompt.ends_with("Do you want to continue? (yes/no)"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let cmd = confirm_data(&state, &mut answered(CONFIRM_DATA, "y")).unwrap();
        assert_eq!(cmd.goto, Goto::Stage(DATA_QUERY_PROMPT.to_string()));
    }

    #[test]
    fn test_data_query_prompt_blank_reuses_question() {
        let mut state = WorkflowState::new("c1");
        state.begin_turn("show category counts");
        state.summary = "old".to_string();
        state.chart = Some(ChartRef::new("/tmp/old.png"));

        let cmd = data_query_prompt(&state, &mut answered(DATA_QUERY_PROMPT, "   ")).unwrap();
        assert_eq!(cmd.goto, Goto::Stage(PLOT.to_string()));

        state.apply(cmd.update);
        assert_eq!(state.data_query, "show category counts");
        assert!(state.chart.is_none());
        assert!(state.summary.is_empty());
    }

    #[test]
    fn test_data_query_prompt_quit_keywords() {
        let state = WorkflowState::new("c1");
        for word in ["quit", "STOP", " End ", "finish"] {
            let cmd = data_query_prompt(&state, &mut answered(DATA_QUERY_PROMPT, word)).unwrap();
            assert_eq!(cmd.goto, Goto::End, "{word} should end the turn");
        }
    }

    #[test]
    fn test_data_query_prompt_text() {
        assert_eq!(
            data_query_prompt_text("sales"),
            "Write instructions for the data plot. Leave empty for original query: `sales`\nType 'quit' or 'stop' to exit."
        );
    }
}
