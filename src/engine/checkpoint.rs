//! Checkpoint persistence for save/resume capability
//!
//! Provides:
//! - Checkpoint serialization via MessagePack or JSON
//! - In-memory persistence for single-process deployments
//! - File-based persistence for conversations that must survive a restart

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::engine::interrupt::{Interrupt, ResumeToken};
use crate::engine::state::WorkflowState;
use crate::error::{FlowError, FlowResult};

/// Where a conversation's current turn stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// A stage completed and the next one has not run yet
    Running,
    /// Waiting for a human answer
    Interrupted,
    /// The turn reached END
    Completed,
    /// The turn failed; the state is usable for a new turn
    Aborted,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Completed | TurnStatus::Aborted)
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnStatus::Running => write!(f, "running"),
            TurnStatus::Interrupted => write!(f, "interrupted"),
            TurnStatus::Completed => write!(f, "completed"),
            TurnStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Conversation ids become file and directory names, so they are limited to
/// ASCII letters, digits, `-` and `_`
pub fn is_valid_conversation_id(conversation_id: &str) -> bool {
    !conversation_id.is_empty()
        && conversation_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A suspended stage together with the answers already collected for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub interrupt: Interrupt,

    /// Answers to earlier interrupts of the same stage attempt
    #[serde(default)]
    pub answers: Vec<String>,
}

impl PendingInterrupt {
    /// Resume token replaying the earlier answers followed by `answer`
    pub fn resume_with(&self, answer: impl Into<String>) -> ResumeToken {
        ResumeToken {
            stage: self.interrupt.stage.clone(),
            answers: self
                .answers
                .iter()
                .cloned()
                .chain(std::iter::once(answer.into()))
                .collect(),
        }
    }
}

/// A checkpoint representing a conversation at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint ID
    pub id: String,

    /// Conversation this checkpoint belongs to
    pub conversation_id: String,

    /// Monotonic step counter within the conversation
    pub step: u64,

    /// Stage to run next, `None` once the turn is over
    pub next_stage: Option<String>,

    pub status: TurnStatus,

    /// State after the last completed stage
    pub state: WorkflowState,

    /// Pending human input, if any
    #[serde(default)]
    pub pending: Option<PendingInterrupt>,

    /// Timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// Additional metadata
    #[serde(default)]
    pub metadata: JsonValue,
}

impl Checkpoint {
    /// Create a new checkpoint for `state`
    pub fn new(state: WorkflowState, next_stage: Option<String>, status: TurnStatus) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: state.conversation_id.clone(),
            step: 0,
            next_stage,
            status,
            state,
            pending: None,
            created_at: chrono::Utc::now(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    pub fn with_pending(mut self, pending: PendingInterrupt) -> Self {
        self.pending = Some(pending);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    /// Serialize to bytes (MessagePack format)
    pub fn to_bytes(&self) -> FlowResult<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| FlowError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes (MessagePack format)
    pub fn from_bytes(bytes: &[u8]) -> FlowResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| FlowError::Serialization(e.to_string()))
    }

    pub fn to_json(&self) -> FlowResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| FlowError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> FlowResult<Self> {
        serde_json::from_str(json).map_err(|e| FlowError::Serialization(e.to_string()))
    }
}

/// Checkpointer trait for persistence backends
///
/// Checkpoints are keyed by conversation. Implementations must be safe to
/// share between threads working on distinct conversations.
pub trait Checkpointer: Send + Sync {
    /// Save a checkpoint, returning where it was stored
    fn save(&self, checkpoint: &Checkpoint) -> FlowResult<String>;

    /// Load the latest checkpoint of a conversation
    fn load(&self, conversation_id: &str) -> FlowResult<Option<Checkpoint>>;

    /// All checkpoints of a conversation, oldest first
    fn history(&self, conversation_id: &str) -> FlowResult<Vec<Checkpoint>>;

    /// Delete every checkpoint of a conversation
    fn delete(&self, conversation_id: &str) -> FlowResult<()>;

    /// List conversation IDs with at least one checkpoint
    fn list(&self) -> FlowResult<Vec<String>>;
}

/// File-based checkpointer
///
/// Layout: `<dir>/<conversation_id>/<step>.{bin,json}`.
pub struct FileCheckpointer {
    dir: PathBuf,

    /// Use binary format (MessagePack) vs JSON
    binary: bool,
}

impl FileCheckpointer {
    /// Create a new file checkpointer writing MessagePack
    pub fn new<P: AsRef<Path>>(dir: P) -> FlowResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self { dir, binary: true })
    }

    /// Create checkpointer with JSON format
    pub fn json<P: AsRef<Path>>(dir: P) -> FlowResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self { dir, binary: false })
    }

    fn extension(&self) -> &'static str {
        if self.binary {
            "bin"
        } else {
            "json"
        }
    }

    fn conversation_dir(&self, conversation_id: &str) -> FlowResult<PathBuf> {
        if !is_valid_conversation_id(conversation_id) {
            return Err(FlowError::Checkpoint(format!(
                "invalid conversation id '{conversation_id}'"
            )));
        }
        Ok(self.dir.join(conversation_id))
    }

    fn checkpoint_path(&self, conversation_id: &str, step: u64) -> FlowResult<PathBuf> {
        Ok(self
            .conversation_dir(conversation_id)?
            .join(format!("{:010}.{}", step, self.extension())))
    }

    fn read_file(&self, path: &Path) -> FlowResult<Checkpoint> {
        if path.extension().map_or(false, |e| e == "bin") {
            Checkpoint::from_bytes(&fs::read(path)?)
        } else {
            Checkpoint::from_json(&fs::read_to_string(path)?)
        }
    }

    /// Checkpoint files of a conversation sorted by step
    fn step_files(&self, conversation_id: &str) -> FlowResult<Vec<PathBuf>> {
        let dir = self.conversation_dir(conversation_id)?;
        if !dir.is_dir() {
            return Ok(vec![]);
        }

        let ext = self.extension();
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |e| e == ext))
            .collect();
        // zero-padded names sort by step
        files.sort();
        Ok(files)
    }
}

impl Checkpointer for FileCheckpointer {
    fn save(&self, checkpoint: &Checkpoint) -> FlowResult<String> {
        let path = self.checkpoint_path(&checkpoint.conversation_id, checkpoint.step)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = if self.binary {
            checkpoint.to_bytes()?
        } else {
            checkpoint.to_json()?.into_bytes()
        };

        // write then rename so a crash never leaves a torn latest checkpoint
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;

        Ok(path.to_string_lossy().to_string())
    }

    fn load(&self, conversation_id: &str) -> FlowResult<Option<Checkpoint>> {
        match self.step_files(conversation_id)?.last() {
            Some(path) => self.read_file(path).map(Some),
            None => Ok(None),
        }
    }

    fn history(&self, conversation_id: &str) -> FlowResult<Vec<Checkpoint>> {
        self.step_files(conversation_id)?
            .iter()
            .map(|p| self.read_file(p))
            .collect()
    }

    fn delete(&self, conversation_id: &str) -> FlowResult<()> {
        let dir = self.conversation_dir(conversation_id)?;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn list(&self) -> FlowResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() {
                if let Some(name) = path.file_name() {
                    ids.push(name.to_string_lossy().to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Checkpoints kept per conversation by [`MemoryCheckpointer`] unless configured otherwise
pub const DEFAULT_HISTORY_LIMIT: usize = 64;

/// In-memory checkpointer, lives as long as the process
///
/// Only the most recent `history_limit` checkpoints of each conversation are
/// kept; the oldest ones are dropped first.
pub struct MemoryCheckpointer {
    checkpoints: parking_lot::RwLock<HashMap<String, VecDeque<Checkpoint>>>,
    history_limit: usize,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keep at most `limit` checkpoints per conversation (at least one)
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            checkpoints: parking_lot::RwLock::new(HashMap::new()),
            history_limit: limit.max(1),
        }
    }
}

impl Default for MemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn save(&self, checkpoint: &Checkpoint) -> FlowResult<String> {
        let mut checkpoints = self.checkpoints.write();
        let history = checkpoints
            .entry(checkpoint.conversation_id.clone())
            .or_default();
        history.push_back(checkpoint.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
        Ok(checkpoint.id.clone())
    }

    fn load(&self, conversation_id: &str) -> FlowResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .get(conversation_id)
            .and_then(|history| history.back().cloned()))
    }

    fn history(&self, conversation_id: &str) -> FlowResult<Vec<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .get(conversation_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, conversation_id: &str) -> FlowResult<()> {
        self.checkpoints.write().remove(conversation_id);
        Ok(())
    }

    fn list(&self) -> FlowResult<Vec<String>> {
        let mut ids: Vec<String> = self.checkpoints.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
