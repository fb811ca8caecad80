//! Task data model.
//!
//! Tasks are the declared units of work. Each task tracks its status,
//! the worker it was handed to, and the workspace it runs in.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::workspace::WorkspaceId;

/// Identifier of a task as declared in the submitted task list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the id against the accepted shape.
    pub fn validate(&self) -> Result<()> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("static task id pattern")
        });
        if pattern.is_match(&self.0) {
            Ok(())
        } else {
            Err(Error::Configuration(format!("invalid task id '{}'", self.0)))
        }
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the external worker a task was handed to.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Declared, dependencies not yet merged.
    #[default]
    Pending,
    /// Every dependency merged; waiting for a workspace.
    Ready,
    /// Workspace allocated and handed to a worker.
    Assigned,
    /// Worker acknowledged and is executing.
    InProgress,
    /// Worker reported success; waiting to be merged.
    Completed,
    /// Execution failed, timed out, or a dependency failed.
    Failed,
    /// Work integrated into the target line.
    Merged,
    /// Withdrawn by an operator.
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Merged => "merged",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether `next` is a legal successor of this status.
    ///
    /// The happy path is strictly forward. Failure is reachable from
    /// assigned/in-progress (execution) and from pending/ready (propagated
    /// from a dependency). Requeueing a failed task is not a transition;
    /// it goes through [`Task::requeue`].
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Ready, Assigned)
                | (Assigned, InProgress)
                | (InProgress, Completed)
                | (Completed, Merged)
                | (Assigned, Failed)
                | (InProgress, Failed)
                | (Pending, Failed)
                | (Ready, Failed)
                | (Pending, Cancelled)
                | (Ready, Cancelled)
                | (Assigned, Cancelled)
                | (InProgress, Cancelled)
        )
    }

    /// Merged, failed, and cancelled tasks see no further scheduling.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Merged | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses that hold a live workspace.
    pub fn holds_workspace(&self) -> bool {
        matches!(
            self,
            TaskStatus::Assigned | TaskStatus::InProgress | TaskStatus::Completed
        )
    }

    /// Dependents of a task in this status can never run.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => TaskStatus::Pending,
            "ready" => TaskStatus::Ready,
            "assigned" => TaskStatus::Assigned,
            "in-progress" | "in_progress" => TaskStatus::InProgress,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "merged" => TaskStatus::Merged,
            "cancelled" => TaskStatus::Cancelled,
            other => return Err(Error::Configuration(format!("unknown status '{}'", other))),
        })
    }
}

/// A task record as submitted by the task-list producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "dependsOn", alias = "depends_on")]
    pub depends_on: Vec<TaskId>,
    /// Per-task override of the default deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

impl TaskSpec {
    pub fn new(id: &str, depends_on: &[&str]) -> Self {
        Self {
            id: TaskId::from(id),
            label: id.to_string(),
            depends_on: depends_on.iter().map(|d| TaskId::from(*d)).collect(),
            deadline_secs: None,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_deadline_secs(mut self, secs: u64) -> Self {
        self.deadline_secs = Some(secs);
        self
    }
}

/// Scheduler-side view of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub dependencies: Vec<TaskId>,
    pub status: TaskStatus,
    pub owner: Option<WorkerId>,
    pub workspace: Option<WorkspaceId>,
    pub deadline_secs: Option<u64>,
    /// Attempt number; bumped by every requeue.
    pub attempt: u32,
    pub cancel_requested: bool,
    /// Failure reason or worker summary.
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn from_spec(spec: &TaskSpec) -> Self {
        let label = if spec.label.is_empty() {
            spec.id.to_string()
        } else {
            spec.label.clone()
        };
        Self {
            id: spec.id.clone(),
            label,
            dependencies: spec.depends_on.clone(),
            status: TaskStatus::Pending,
            owner: None,
            workspace: None,
            deadline_secs: spec.deadline_secs,
            attempt: 1,
            cancel_requested: false,
            summary: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            TaskStatus::InProgress => self.started_at = Some(Utc::now()),
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Cancelled
            | TaskStatus::Merged => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Put a failed task back to pending for a fresh attempt.
    pub fn requeue(&mut self) -> Result<()> {
        if self.status != TaskStatus::Failed {
            return Err(Error::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        self.status = TaskStatus::Pending;
        self.attempt += 1;
        self.owner = None;
        self.workspace = None;
        self.cancel_requested = false;
        self.summary = None;
        self.started_at = None;
        self.finished_at = None;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}
