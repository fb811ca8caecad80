use std::path::PathBuf;

use thiserror::Error;

use crate::core::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Dependency cycle: {}", format_cycle(.cycle))]
    Cycle { cycle: Vec<TaskId> },

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Merge conflict for task {task_id} in {} file(s)", .files.len())]
    MergeConflict { task_id: TaskId, files: Vec<PathBuf> },

    #[error("Task {task_id} exceeded its deadline of {deadline}")]
    DeadlineExceeded {
        task_id: TaskId,
        deadline: chrono::DateTime<chrono::Utc>,
    },

    #[error("Invalid status transition for {task_id} from {from} to {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: String,
        to: String,
    },

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Signal channel closed")]
    ChannelClosed,
}

impl Error {
    /// Errors that may succeed on a later attempt without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Allocation(_))
    }

    /// Errors that reject a whole submission before any side effect.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::Cycle { .. })
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    let mut names: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
    if let Some(first) = names.first().cloned() {
        names.push(first);
    }
    names.join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
