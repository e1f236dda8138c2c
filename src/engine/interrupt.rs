//! Suspend/resume support for human-in-the-loop stages
//!
//! A stage asks for human input with [`InterruptContext::interrupt`]. There is
//! no coroutine behind it: the first time the call is reached it fails with
//! [`FlowError::Interrupted`], the executor checkpoints the pending prompt and
//! returns control to the caller. On resume the executor re-runs the same stage
//! from its top with a [`ResumeToken`] carrying every answer given so far, and
//! the n-th `interrupt` call returns the n-th answer instead of suspending.

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};

/// A pending request for human input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Stage that is suspended
    pub stage: String,

    /// Prompt to show to the human
    pub prompt: String,

    /// Position of this interrupt among the calls made by the stage
    pub index: usize,
}

/// Answers to replay into a suspended stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub stage: String,
    pub answers: Vec<String>,
}

impl ResumeToken {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            answers: Vec::new(),
        }
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answers.push(answer.into());
        self
    }
}

/// Per-attempt interrupt bookkeeping handed to a stage
#[derive(Debug)]
pub struct InterruptContext {
    stage: String,
    answers: Vec<String>,
    cursor: usize,
}

impl InterruptContext {
    /// Context for a fresh run of `stage`
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            answers: Vec::new(),
            cursor: 0,
        }
    }

    /// Context that replays the answers of `token`
    pub fn replay(token: &ResumeToken) -> Self {
        Self {
            stage: token.stage.clone(),
            answers: token.answers.clone(),
            cursor: 0,
        }
    }

    /// Return the recorded answer for this call, or suspend with `prompt`
    pub fn interrupt(&mut self, prompt: impl Into<String>) -> FlowResult<String> {
        if let Some(answer) = self.answers.get(self.cursor) {
            self.cursor += 1;
            return Ok(answer.clone());
        }

        Err(FlowError::Interrupted(Interrupt {
            stage: self.stage.clone(),
            prompt: prompt.into(),
            index: self.cursor,
        }))
    }

    /// Answers consumed so far in this attempt
    pub fn consumed(&self) -> &[String] {
        &self.answers[..self.cursor]
    }
}
