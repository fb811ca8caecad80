//! Registry entry and update types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Task, TaskId, TaskStatus, WorkerId};
use crate::error::{Error, Result};
use crate::workspace::{Workspace, WorkspaceId};

/// Where a task runs: enough for a worker to find its directory and branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub id: WorkspaceId,
    pub path: PathBuf,
    pub branch: String,
    pub base_revision: String,
}

impl From<&Workspace> for WorkspaceRef {
    fn from(ws: &Workspace) -> Self {
        Self {
            id: ws.id,
            path: ws.path.clone(),
            branch: ws.branch.clone(),
            base_revision: ws.base_revision.clone(),
        }
    }
}

/// Externally visible record of one attempt at a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub task_id: TaskId,
    pub label: String,
    pub owner: Option<WorkerId>,
    pub workspace: Option<WorkspaceRef>,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub attempt: u32,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub summary: Option<String>,
    /// Upstream task whose failure or cancellation failed this one.
    #[serde(default)]
    pub propagated_from: Option<TaskId>,
    /// Superseded by a requeue; kept for history.
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegistryEntry {
    /// Entry for a task that was just handed a workspace.
    pub fn assigned(task: &Task, owner: WorkerId, workspace: &Workspace) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id.clone(),
            label: task.label.clone(),
            owner: Some(owner),
            workspace: Some(WorkspaceRef::from(workspace)),
            status: TaskStatus::Assigned,
            dependencies: task.dependencies.clone(),
            attempt: task.attempt,
            cancel_requested: false,
            summary: None,
            propagated_from: None,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Entry for a task that reached a terminal state without a workspace.
    pub fn unassigned(
        task_id: TaskId,
        label: &str,
        dependencies: Vec<TaskId>,
        status: TaskStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            label: label.to_string(),
            owner: None,
            workspace: None,
            status,
            dependencies,
            attempt: 1,
            cancel_requested: false,
            summary: None,
            propagated_from: None,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn propagated_from(mut self, culprit: TaskId) -> Self {
        self.propagated_from = Some(culprit);
        self
    }

    pub fn is_active(&self) -> bool {
        !self.archived
    }
}

/// Fields to change in one atomic registry update. `None` leaves a
/// field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryUpdate {
    pub status: Option<TaskStatus>,
    pub owner: Option<WorkerId>,
    pub workspace: Option<WorkspaceRef>,
    pub summary: Option<String>,
    pub cancel_requested: Option<bool>,
    pub propagated_from: Option<TaskId>,
    pub archived: Option<bool>,
}

impl EntryUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn cancel_requested() -> Self {
        Self {
            cancel_requested: Some(true),
            ..Default::default()
        }
    }

    pub fn archive() -> Self {
        Self {
            archived: Some(true),
            ..Default::default()
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_owner(mut self, owner: WorkerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_workspace(mut self, workspace: WorkspaceRef) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn with_propagated_from(mut self, culprit: TaskId) -> Self {
        self.propagated_from = Some(culprit);
        self
    }

    /// Produce the updated entry, or an error with `entry` untouched.
    pub(crate) fn apply_to(&self, entry: &RegistryEntry) -> Result<RegistryEntry> {
        let mut next = entry.clone();
        if let Some(status) = self.status {
            if status != entry.status && !entry.status.can_transition_to(status) {
                return Err(Error::InvalidTransition {
                    task_id: entry.task_id.clone(),
                    from: entry.status.to_string(),
                    to: status.to_string(),
                });
            }
            next.status = status;
        }
        if let Some(owner) = self.owner {
            next.owner = Some(owner);
        }
        if let Some(workspace) = &self.workspace {
            next.workspace = Some(workspace.clone());
        }
        if let Some(summary) = &self.summary {
            next.summary = Some(summary.clone());
        }
        if let Some(flag) = self.cancel_requested {
            next.cancel_requested = flag;
        }
        if let Some(culprit) = &self.propagated_from {
            next.propagated_from = Some(culprit.clone());
        }
        if let Some(flag) = self.archived {
            next.archived = flag;
        }
        next.updated_at = Utc::now().max(entry.updated_at);
        Ok(next)
    }
}
