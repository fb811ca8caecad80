//! Isolated per-task workspaces backed by git worktrees.

mod manager;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::TaskId;

pub use manager::WorkspaceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceId(pub Uuid);

impl WorkspaceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, used in branch and directory names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for WorkspaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkspaceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkspaceState {
    Allocated,
    Active,
    PendingMerge,
    Released,
}

impl WorkspaceState {
    /// Counts against the concurrency quota.
    pub fn is_live(&self) -> bool {
        matches!(self, WorkspaceState::Allocated | WorkspaceState::Active)
    }

    pub fn can_transition_to(&self, next: WorkspaceState) -> bool {
        use WorkspaceState::*;
        matches!(
            (self, next),
            (Allocated, Active)
                | (Allocated, PendingMerge)
                | (Active, PendingMerge)
                | (Allocated, Released)
                | (Active, Released)
                | (PendingMerge, Released)
        )
    }
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceState::Allocated => "allocated",
            WorkspaceState::Active => "active",
            WorkspaceState::PendingMerge => "pending-merge",
            WorkspaceState::Released => "released",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
    pub base_revision: String,
    pub state: WorkspaceState,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn is_released(&self) -> bool {
        self.state == WorkspaceState::Released
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }
}
