//! Scheduler for dependency-ordered task execution.
//!
//! The Scheduler owns the task table and drives every task from
//! submission to merge through a single operation, [`Scheduler::tick`].
//! A tick never waits on a worker: it consumes whatever signals have
//! arrived, expires overdue work, merges finished work in declaration
//! order, fails the dependents of failed tasks, and hands fresh
//! workspaces to tasks that became ready.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::core::{DependencyGraph, Task, TaskId, TaskSpec, TaskStatus, WorkerId};
use crate::git::GitOps;
use crate::orchestration::reconciler::{MergeOutcome, Reconciler};
use crate::orchestration::signal::{
    drain_channel, drain_signal_files, ExecutionSignal, SignalKind, SignalSender,
};
use crate::registry::{CoordinationRegistry, EntryUpdate, RegistryEntry};
use crate::util::blocking;
use crate::workspace::{Workspace, WorkspaceId, WorkspaceManager, WorkspaceState};
use crate::{glog, glog_debug, glog_error, glog_trace, glog_warn, Error, Result};

/// Events emitted by the scheduler for task lifecycle changes.
///
/// Delivery is best effort: a full or closed channel never stalls a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TaskReady {
        task_id: TaskId,
    },
    /// A workspace was allocated and the task handed to a worker.
    TaskAssigned {
        task_id: TaskId,
        worker: WorkerId,
        path: PathBuf,
        branch: String,
    },
    TaskStarted {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskMerged {
        task_id: TaskId,
        commit: String,
    },
    MergeConflict {
        task_id: TaskId,
        files: Vec<PathBuf>,
    },
    TaskFailed {
        task_id: TaskId,
        reason: String,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    /// Every submitted task reached a terminal status.
    AllTasksFinished,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub signals: usize,
    pub started: Vec<TaskId>,
    pub completed: Vec<TaskId>,
    pub expired: Vec<TaskId>,
    pub merged: Vec<TaskId>,
    pub conflicts: Vec<TaskId>,
    /// Every task that became `failed` this tick, for any reason.
    pub failed: Vec<TaskId>,
    pub cancelled: Vec<TaskId>,
    pub assigned: Vec<TaskId>,
    /// Ready tasks left waiting for capacity or a retryable allocation error.
    pub deferred: Vec<TaskId>,
}

impl TickReport {
    pub fn made_progress(&self) -> bool {
        self.signals > 0
            || !self.expired.is_empty()
            || !self.merged.is_empty()
            || !self.conflicts.is_empty()
            || !self.failed.is_empty()
            || !self.cancelled.is_empty()
            || !self.assigned.is_empty()
    }
}

/// Result of [`Scheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task is now `cancelled`.
    Cancelled,
    /// The task is running; its worker will be stopped on its next signal.
    Requested,
}

/// Why a task failed and what its failure took down with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub reason: Option<String>,
    /// Set when this task itself failed because of an upstream task.
    pub propagated_from: Option<TaskId>,
    /// Every transitive dependent and its current status.
    pub affected: Vec<(TaskId, TaskStatus)>,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.task_id, self.status)?;
        if let Some(reason) = &self.reason {
            write!(f, ": {}", reason)?;
        }
        if let Some(culprit) = &self.propagated_from {
            write!(f, " (caused by {})", culprit)?;
        }
        for (id, status) in &self.affected {
            write!(f, "\n  -> {} [{}]", id, status)?;
        }
        Ok(())
    }
}

/// Scheduler for dependency-ordered execution in isolated workspaces.
///
/// # Example
///
/// ```ignore
/// let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(100);
/// let mut scheduler = Scheduler::open(config, repo_path, event_tx)?;
/// scheduler.submit(&specs)?;
/// scheduler.run(config.tick_interval(), CancellationToken::new()).await?;
/// ```
pub struct Scheduler {
    config: OrchestratorConfig,
    graph: DependencyGraph,
    tasks: HashMap<TaskId, Task>,
    /// Task ids in declaration order.
    order: Vec<TaskId>,
    registry: Arc<CoordinationRegistry>,
    workspaces: Arc<WorkspaceManager>,
    reconciler: Arc<Reconciler>,
    signal_tx: Sender<ExecutionSignal>,
    signal_rx: Receiver<ExecutionSignal>,
    signals_dir: Option<PathBuf>,
    event_tx: mpsc::Sender<SchedulerEvent>,
    /// Completed tasks whose last merge attempt conflicted; skipped until
    /// `retry_merge`.
    conflicted: HashSet<TaskId>,
}

impl Scheduler {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<CoordinationRegistry>,
        workspaces: Arc<WorkspaceManager>,
        reconciler: Arc<Reconciler>,
        event_tx: mpsc::Sender<SchedulerEvent>,
    ) -> Self {
        let (signal_tx, signal_rx) = crossbeam_channel::unbounded();
        let signals_dir = config.signals_dir().ok();
        Self {
            config,
            graph: DependencyGraph::default(),
            tasks: HashMap::new(),
            order: Vec::new(),
            registry,
            workspaces,
            reconciler,
            signal_tx,
            signal_rx,
            signals_dir,
            event_tx,
            conflicted: HashSet::new(),
        }
    }

    /// Wire up registry, workspace manager, and reconciler from `config`
    /// for the repository at `repo_path`.
    pub fn open(
        config: OrchestratorConfig,
        repo_path: &Path,
        event_tx: mpsc::Sender<SchedulerEvent>,
    ) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;
        let registry = Arc::new(CoordinationRegistry::open(&config.registry_path()?)?);
        let workspaces = Arc::new(WorkspaceManager::new(
            GitOps::new(repo_path)?,
            &config.worktrees_dir()?,
            &config.branch_prefix,
            config.max_concurrent,
        ));
        let reconciler = Arc::new(Reconciler::new(
            GitOps::new(repo_path)?,
            &config.target_branch,
            config.auto_commit,
        ));
        Ok(Self::new(config, registry, workspaces, reconciler, event_tx))
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log_dropped_event(&e);
        }
    }

    fn deadline_for(&self, task: &Task) -> Option<chrono::Duration> {
        task.deadline_secs
            .map(Duration::from_secs)
            .or_else(|| self.config.default_deadline())
            .and_then(|d| chrono::Duration::from_std(d).ok())
    }

    // ------------------------------------------------------------------
    // Submission and resume
    // ------------------------------------------------------------------

    /// Validate and load the task list, then pick up any state the
    /// registry already holds for these tasks.
    ///
    /// Validation is all-or-nothing: on error nothing is loaded.
    pub fn submit(&mut self, specs: &[TaskSpec]) -> Result<()> {
        if !self.tasks.is_empty() {
            return Err(Error::Configuration(
                "tasks were already submitted to this scheduler".to_string(),
            ));
        }
        let mut graph = DependencyGraph::build(specs)?;
        let mut tasks: HashMap<TaskId, Task> = specs
            .iter()
            .map(|spec| (spec.id.clone(), Task::from_spec(spec)))
            .collect();

        let mut lost = Vec::new();
        for task in tasks.values_mut() {
            if let Some(id) = self.resume_task(task) {
                lost.push(id);
            }
        }
        graph.sync_merged(&self.registry);

        self.order = graph.task_ids();
        self.graph = graph;
        self.tasks = tasks;

        let resumed = self
            .tasks
            .values()
            .filter(|t| t.status != TaskStatus::Pending)
            .count();
        glog!(
            "Submitted {} task(s) with {} dependencies ({} resumed from registry)",
            self.graph.len(),
            self.graph.dependency_count(),
            resumed
        );

        lost.sort_by_key(|id| self.graph.declaration_index(id));
        for id in lost {
            let reason = "workspace directory was lost before resume".to_string();
            match self.advance(&id, TaskStatus::Failed, EntryUpdate::default().with_summary(&reason)) {
                Ok(()) => self.emit(SchedulerEvent::TaskFailed { task_id: id, reason }),
                Err(e) => glog_error!("Could not fail {} after lost workspace: {}", id, e),
            }
        }
        Ok(())
    }

    /// Copy registry state into `task`. Returns the id if its live
    /// workspace could not be re-attached.
    fn resume_task(&self, task: &mut Task) -> Option<TaskId> {
        let history = self.registry.history(&task.id);
        let last = history.last()?;
        if last.archived {
            task.attempt = last.attempt + 1;
            return None;
        }
        task.attempt = last.attempt;
        task.status = last.status;
        task.owner = last.owner;
        task.summary = last.summary.clone();
        task.cancel_requested = last.cancel_requested;

        if !last.status.holds_workspace() {
            return None;
        }
        let wref = last.workspace.as_ref()?;
        let state = match last.status {
            TaskStatus::Assigned => WorkspaceState::Allocated,
            TaskStatus::InProgress => WorkspaceState::Active,
            _ => WorkspaceState::PendingMerge,
        };
        let workspace = Workspace {
            id: wref.id,
            task_id: task.id.clone(),
            path: wref.path.clone(),
            branch: wref.branch.clone(),
            base_revision: wref.base_revision.clone(),
            state,
            deadline: self.deadline_for(task).map(|d| last.created_at + d),
            created_at: last.created_at,
        };
        match self.workspaces.adopt(workspace) {
            Ok(()) => {
                task.workspace = Some(wref.id);
                None
            }
            Err(e) => {
                glog_warn!("Cannot adopt workspace for {}: {}", task.id, e);
                Some(task.id.clone())
            }
        }
    }

    // ------------------------------------------------------------------
    // Status bookkeeping
    // ------------------------------------------------------------------

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))
    }

    fn get_task(&self, id: &TaskId) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))
    }

    /// Move a registered task to `next`: registry first, then the table.
    fn advance(&mut self, id: &TaskId, next: TaskStatus, mut update: EntryUpdate) -> Result<()> {
        let task = self.get_task(id)?;
        if !task.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task_id: id.clone(),
                from: task.status.to_string(),
                to: next.to_string(),
            });
        }
        update.status = Some(next);
        let summary = update.summary.clone();
        self.registry.update(id, update)?;

        let task = self.task_mut(id)?;
        task.transition(next)?;
        if summary.is_some() {
            task.summary = summary;
        }
        Ok(())
    }

    /// Terminate a task that never held a workspace, recording an entry so
    /// observers can see what happened to it.
    fn finish_unassigned(
        &mut self,
        id: &TaskId,
        next: TaskStatus,
        reason: &str,
        culprit: Option<TaskId>,
    ) -> Result<()> {
        let task = self.get_task(id)?;
        if !task.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task_id: id.clone(),
                from: task.status.to_string(),
                to: next.to_string(),
            });
        }
        let mut entry =
            RegistryEntry::unassigned(id.clone(), &task.label, task.dependencies.clone(), next)
                .with_attempt(task.attempt)
                .with_summary(reason);
        if let Some(culprit) = culprit {
            entry = entry.propagated_from(culprit);
        }
        self.registry.register(entry)?;

        let task = self.task_mut(id)?;
        task.transition(next)?;
        task.summary = Some(reason.to_string());
        Ok(())
    }

    async fn release_workspace(&self, id: &TaskId) {
        let Some(ws_id) = self.tasks.get(id).and_then(|t| t.workspace) else {
            return;
        };
        let manager = Arc::clone(&self.workspaces);
        if let Err(e) = blocking(move || manager.release(ws_id)).await {
            glog_warn!("Failed to release workspace for {}: {}", id, e);
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Advance every task as far as it can go right now.
    pub async fn tick(&mut self) -> Result<TickReport> {
        let mut report = TickReport::default();

        self.drain_signals(&mut report).await;
        self.expire_deadlines(&mut report).await;
        self.merge_completed(&mut report).await;
        self.propagate_failures(&mut report);
        self.retry_removals().await;
        self.assign_ready(&mut report).await;

        if report.made_progress() {
            glog_debug!(
                "tick: signals={} merged={} failed={} assigned={} deferred={}",
                report.signals,
                report.merged.len(),
                report.failed.len(),
                report.assigned.len(),
                report.deferred.len()
            );
        }
        Ok(report)
    }

    async fn retry_removals(&self) {
        if self.workspaces.pending_removals().is_empty() {
            return;
        }
        let manager = Arc::clone(&self.workspaces);
        match blocking(move || Ok(manager.retry_pending_removals())).await {
            Ok(0) => {}
            Ok(left) => glog_debug!("{} worktree removal(s) still pending", left),
            Err(e) => glog_warn!("Worktree removal retry failed: {}", e),
        }
    }

    async fn drain_signals(&mut self, report: &mut TickReport) {
        let mut signals = drain_channel(&self.signal_rx);
        if let Some(dir) = &self.signals_dir {
            signals.extend(drain_signal_files(dir));
        }
        report.signals = signals.len();
        for signal in signals {
            let task_id = signal.task_id.clone();
            if let Err(e) = self.handle_signal(signal, report).await {
                glog_warn!("Signal for {} rejected: {}", task_id, e);
            }
        }
    }

    async fn handle_signal(&mut self, signal: ExecutionSignal, report: &mut TickReport) -> Result<()> {
        let id = signal.task_id.clone();
        let Some(task) = self.tasks.get(&id) else {
            glog_warn!("Signal for unknown task {}", id);
            return Ok(());
        };
        if let (Some(from), Some(owner)) = (signal.worker, task.owner) {
            if from != owner {
                glog_debug!("Ignoring stale signal for {} from worker {}", id, from.short());
                return Ok(());
            }
        }
        let status = task.status;
        let cancel_requested = task.cancel_requested;
        let workspace = task.workspace;

        if signal.result == SignalKind::Cancel {
            if let CancelOutcome::Cancelled = self.cancel(&id)? {
                report.cancelled.push(id);
            }
            return Ok(());
        }

        let running = matches!(status, TaskStatus::Assigned | TaskStatus::InProgress);
        if cancel_requested && running {
            self.advance(
                &id,
                TaskStatus::Cancelled,
                EntryUpdate::default().with_summary("cancelled by operator"),
            )?;
            self.release_workspace(&id).await;
            glog!("Task {} cancelled", id);
            report.cancelled.push(id.clone());
            self.emit(SchedulerEvent::TaskCancelled { task_id: id });
            return Ok(());
        }

        match signal.result {
            SignalKind::Started | SignalKind::Success if status == TaskStatus::Assigned => {
                self.advance(&id, TaskStatus::InProgress, EntryUpdate::default())?;
                if let Some(ws) = workspace {
                    self.workspaces.activate(ws)?;
                }
                glog!("Task {} started", id);
                report.started.push(id.clone());
                self.emit(SchedulerEvent::TaskStarted { task_id: id.clone() });
                if signal.result == SignalKind::Success {
                    self.complete(&id, signal.summary, workspace, report)?;
                }
            }
            SignalKind::Success if status == TaskStatus::InProgress => {
                self.complete(&id, signal.summary, workspace, report)?;
            }
            SignalKind::Failure if running => {
                let reason = signal
                    .summary
                    .unwrap_or_else(|| "worker reported failure".to_string());
                self.advance(
                    &id,
                    TaskStatus::Failed,
                    EntryUpdate::default().with_summary(&reason),
                )?;
                self.release_workspace(&id).await;
                glog!("Task {} failed: {}", id, reason);
                report.failed.push(id.clone());
                self.emit(SchedulerEvent::TaskFailed { task_id: id, reason });
            }
            _ => {
                glog_debug!("Ignoring {:?} signal for {} in status {}", signal.result, id, status);
            }
        }
        Ok(())
    }

    fn complete(
        &mut self,
        id: &TaskId,
        summary: Option<String>,
        workspace: Option<WorkspaceId>,
        report: &mut TickReport,
    ) -> Result<()> {
        let mut update = EntryUpdate::default();
        if let Some(summary) = summary {
            update = update.with_summary(summary);
        }
        self.advance(id, TaskStatus::Completed, update)?;
        if let Some(ws) = workspace {
            self.workspaces.mark_pending_merge(ws)?;
        }
        glog!("Task {} completed", id);
        report.completed.push(id.clone());
        self.emit(SchedulerEvent::TaskCompleted { task_id: id.clone() });
        Ok(())
    }

    async fn expire_deadlines(&mut self, report: &mut TickReport) {
        let now = Utc::now();
        let overdue: Vec<(TaskId, chrono::DateTime<Utc>)> = self
            .order
            .iter()
            .filter_map(|id| {
                let task = self.tasks.get(id)?;
                if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                    return None;
                }
                let ws = self.workspaces.get(task.workspace?)?;
                let deadline = ws.deadline?;
                ws.is_overdue(now).then(|| (id.clone(), deadline))
            })
            .collect();

        for (id, deadline) in overdue {
            let reason = Error::DeadlineExceeded {
                task_id: id.clone(),
                deadline,
            }
            .to_string();
            if let Err(e) = self.advance(
                &id,
                TaskStatus::Failed,
                EntryUpdate::default().with_summary(&reason),
            ) {
                glog_error!("Could not expire {}: {}", id, e);
                continue;
            }
            self.release_workspace(&id).await;
            glog_warn!("{}", reason);
            report.expired.push(id.clone());
            report.failed.push(id.clone());
            self.emit(SchedulerEvent::TaskFailed { task_id: id, reason });
        }
    }

    async fn merge_completed(&mut self, report: &mut TickReport) {
        let candidates: Vec<Workspace> = self
            .order
            .iter()
            .filter(|id| !self.conflicted.contains(*id))
            .filter_map(|id| {
                let task = self.tasks.get(id)?;
                if task.status != TaskStatus::Completed {
                    return None;
                }
                self.workspaces.get(task.workspace?)
            })
            .collect();
        if candidates.is_empty() {
            return;
        }

        let results = self.reconciler.merge_all(&candidates).await;
        for (id, result) in results {
            // Errors are recorded on the task; the tick carries on
            let _ = self.settle_merge(&id, result, report).await;
        }
    }

    async fn settle_merge(
        &mut self,
        id: &TaskId,
        result: Result<MergeOutcome>,
        report: &mut TickReport,
    ) -> Result<MergeOutcome> {
        match result {
            Ok(outcome) => {
                self.advance(id, TaskStatus::Merged, EntryUpdate::default())?;
                self.release_workspace(id).await;
                self.conflicted.remove(id);
                let unblocked = self.graph.on_task_merged(id);
                if !unblocked.is_empty() {
                    glog_debug!("{} merged, unblocked {:?}", id, unblocked);
                }
                report.merged.push(id.clone());
                self.emit(SchedulerEvent::TaskMerged {
                    task_id: id.clone(),
                    commit: outcome.commit.clone(),
                });
                Ok(outcome)
            }
            Err(Error::MergeConflict { task_id, files }) => {
                let reason = format!(
                    "merge conflict in {}",
                    files
                        .iter()
                        .map(|f| f.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                self.conflicted.insert(id.clone());
                if let Err(e) = self
                    .registry
                    .update(id, EntryUpdate::default().with_summary(&reason))
                {
                    glog_warn!("Could not record conflict for {}: {}", id, e);
                }
                if let Some(task) = self.tasks.get_mut(id) {
                    task.summary = Some(reason);
                }
                report.conflicts.push(id.clone());
                self.emit(SchedulerEvent::MergeConflict {
                    task_id: id.clone(),
                    files: files.clone(),
                });
                Err(Error::MergeConflict { task_id, files })
            }
            Err(e) => {
                glog_error!("Merge of {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    fn propagate_failures(&mut self, report: &mut TickReport) {
        loop {
            let blocked = self.graph.blocked_by_failure(&self.registry);
            let mut progressed = false;
            for (id, culprit) in blocked {
                let culprit_status = self
                    .tasks
                    .get(&culprit)
                    .map(|t| t.status)
                    .unwrap_or(TaskStatus::Failed);
                let reason = format!("dependency {} is {}", culprit, culprit_status);
                match self.finish_unassigned(&id, TaskStatus::Failed, &reason, Some(culprit)) {
                    Ok(()) => {
                        progressed = true;
                        glog!("Task {} failed: {}", id, reason);
                        report.failed.push(id.clone());
                        self.emit(SchedulerEvent::TaskFailed { task_id: id, reason });
                    }
                    Err(e) => glog_warn!("Could not propagate failure to {}: {}", id, e),
                }
            }
            if !progressed {
                break;
            }
        }
    }

    async fn assign_ready(&mut self, report: &mut TickReport) {
        let ready = self.graph.ready_tasks(&self.registry);
        if ready.is_empty() {
            return;
        }
        for id in &ready {
            if let Some(task) = self.tasks.get_mut(id) {
                if task.status == TaskStatus::Pending && task.transition(TaskStatus::Ready).is_ok() {
                    self.emit(SchedulerEvent::TaskReady { task_id: id.clone() });
                }
            }
        }

        let base = match self.reconciler.target_revision().await {
            Ok(base) => base,
            Err(e) => {
                glog_error!("Cannot resolve target branch: {}", e);
                report.deferred.extend(ready);
                return;
            }
        };

        for id in ready {
            if !self.workspaces.has_capacity() {
                report.deferred.push(id);
                continue;
            }
            match self.assign(&id, &base).await {
                Ok(()) => report.assigned.push(id),
                Err(e) => {
                    if e.is_retryable() {
                        glog_debug!("Deferring {}: {}", id, e);
                    } else {
                        glog_error!("Could not assign {}: {}", id, e);
                    }
                    report.deferred.push(id);
                }
            }
        }
    }

    async fn assign(&mut self, id: &TaskId, base: &str) -> Result<()> {
        let manager = Arc::clone(&self.workspaces);
        let task_id = id.clone();
        let base = base.to_string();
        let mut workspace = blocking(move || manager.allocate(&task_id, &base)).await?;

        let worker = WorkerId::new();
        if let Err(e) = self.bind_workspace(id, worker, &mut workspace) {
            self.discard_workspace(id, workspace.id).await;
            return Err(e);
        }
        let attempt = self.registry.active(id).map(|e| e.attempt);

        let task = self.task_mut(id)?;
        task.transition(TaskStatus::Assigned)?;
        task.owner = Some(worker);
        task.workspace = Some(workspace.id);
        if let Some(attempt) = attempt {
            task.attempt = attempt;
        }
        glog!(
            "Assigned {} to worker {} at {}",
            id,
            worker.short(),
            workspace.path.display()
        );
        self.emit(SchedulerEvent::TaskAssigned {
            task_id: id.clone(),
            worker,
            path: workspace.path,
            branch: workspace.branch,
        });
        Ok(())
    }

    /// Record the assignment in the registry. Every check that can fail
    /// runs before the registry write.
    fn bind_workspace(&self, id: &TaskId, worker: WorkerId, workspace: &mut Workspace) -> Result<()> {
        let task = self.get_task(id)?;
        if !task.status.can_transition_to(TaskStatus::Assigned) {
            return Err(Error::InvalidTransition {
                task_id: id.clone(),
                from: task.status.to_string(),
                to: TaskStatus::Assigned.to_string(),
            });
        }
        workspace.deadline = self.deadline_for(task).map(|d| workspace.created_at + d);
        self.workspaces.set_deadline(workspace.id, workspace.deadline)?;
        self.registry
            .register(RegistryEntry::assigned(task, worker, workspace))
    }

    /// Give back a workspace whose assignment did not go through.
    async fn discard_workspace(&self, id: &TaskId, ws_id: WorkspaceId) {
        let manager = Arc::clone(&self.workspaces);
        if let Err(e) = blocking(move || manager.release(ws_id)).await {
            glog_warn!("Failed to release workspace for {} after assignment error: {}", id, e);
        }
    }

    // ------------------------------------------------------------------
    // Operator actions
    // ------------------------------------------------------------------

    /// Withdraw a task. Tasks not yet running are cancelled outright; running
    /// tasks are flagged and stop on their worker's next signal.
    pub fn cancel(&mut self, id: &TaskId) -> Result<CancelOutcome> {
        let status = self.get_task(id)?.status;
        match status {
            TaskStatus::Pending | TaskStatus::Ready => {
                self.finish_unassigned(id, TaskStatus::Cancelled, "cancelled by operator", None)?;
                glog!("Task {} cancelled", id);
                self.emit(SchedulerEvent::TaskCancelled { task_id: id.clone() });
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Assigned | TaskStatus::InProgress => {
                self.registry.update(id, EntryUpdate::cancel_requested())?;
                self.task_mut(id)?.cancel_requested = true;
                glog!("Cancellation requested for running task {}", id);
                Ok(CancelOutcome::Requested)
            }
            TaskStatus::Cancelled => Ok(CancelOutcome::Cancelled),
            other => Err(Error::InvalidTransition {
                task_id: id.clone(),
                from: other.to_string(),
                to: TaskStatus::Cancelled.to_string(),
            }),
        }
    }

    /// Put a failed task back to `pending`, along with every dependent that
    /// failed only because of it. Returns the restored ids.
    pub fn requeue(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        let status = self.get_task(id)?.status;
        if status != TaskStatus::Failed {
            return Err(Error::InvalidTransition {
                task_id: id.clone(),
                from: status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        self.registry.update(id, EntryUpdate::archive())?;
        self.task_mut(id)?.requeue()?;
        let mut restored = vec![id.clone()];

        for dependent in self.graph.downstream(id) {
            let Some(entry) = self.registry.active(&dependent) else {
                continue;
            };
            if entry.status == TaskStatus::Failed && entry.propagated_from.is_some() {
                self.registry.update(&dependent, EntryUpdate::archive())?;
                self.task_mut(&dependent)?.requeue()?;
                restored.push(dependent);
            }
        }
        glog!("Requeued {:?}", restored);
        Ok(restored)
    }

    /// Try again to merge a completed task, typically after its conflict
    /// was resolved on the task branch.
    pub async fn retry_merge(&mut self, id: &TaskId) -> Result<MergeOutcome> {
        let task = self.get_task(id)?;
        if task.status != TaskStatus::Completed {
            return Err(Error::InvalidTransition {
                task_id: id.clone(),
                from: task.status.to_string(),
                to: TaskStatus::Merged.to_string(),
            });
        }
        let workspace = task
            .workspace
            .and_then(|ws| self.workspaces.get(ws))
            .ok_or_else(|| Error::NotFound(format!("workspace for task {}", id)))?;
        self.conflicted.remove(id);

        let result = self.reconciler.merge(&workspace).await;
        let mut report = TickReport::default();
        self.settle_merge(id, result, &mut report).await
    }

    /// Tick until every task is finished, progress stalls, or `cancel` fires.
    pub async fn run(&mut self, interval: Duration, cancel: CancellationToken) -> Result<()> {
        glog!(
            "Scheduler running {} task(s), max {} concurrent, tick every {:?}",
            self.tasks.len(),
            self.workspaces.capacity(),
            interval
        );
        loop {
            self.tick().await?;
            if self.is_finished() {
                glog!("All tasks finished");
                self.emit(SchedulerEvent::AllTasksFinished);
                return Ok(());
            }
            if self.is_stalled() {
                glog_warn!(
                    "Scheduler stalled: {} task(s) waiting on unresolved merge conflicts",
                    self.conflicted.len()
                );
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    glog!("Scheduler stopped by cancellation");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn failure_report(&self, id: &TaskId) -> Result<FailureReport> {
        let task = self.get_task(id)?;
        let propagated_from = self
            .registry
            .active(id)
            .and_then(|entry| entry.propagated_from);
        let affected = self
            .graph
            .downstream(id)
            .into_iter()
            .filter_map(|dep| self.tasks.get(&dep).map(|t| (dep, t.status)))
            .collect();
        Ok(FailureReport {
            task_id: id.clone(),
            status: task.status,
            reason: task.summary.clone(),
            propagated_from,
            affected,
        })
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> Vec<&Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|t| t.status)
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.values().all(Task::is_finished)
    }

    /// Nothing is running or ready, and every completed task is stuck on
    /// a merge conflict.
    pub fn is_stalled(&self) -> bool {
        !self.is_finished()
            && self.tasks.values().all(|t| match t.status {
                TaskStatus::Ready | TaskStatus::Assigned | TaskStatus::InProgress => false,
                TaskStatus::Completed => self.conflicted.contains(&t.id),
                _ => true,
            })
            && self.graph.ready_tasks(&self.registry).is_empty()
    }

    pub fn conflicted(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.conflicted.iter().cloned().collect();
        ids.sort_by_key(|id| self.graph.declaration_index(id));
        ids
    }

    pub fn signal_sender(&self) -> SignalSender {
        SignalSender::new(self.signal_tx.clone())
    }

    pub fn registry(&self) -> &Arc<CoordinationRegistry> {
        &self.registry
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}

fn log_dropped_event(e: &mpsc::error::TrySendError<SchedulerEvent>) {
    match e {
        mpsc::error::TrySendError::Full(event) => {
            glog_trace!("Event channel full, dropped {:?}", event)
        }
        mpsc::error::TrySendError::Closed(_) => {}
    }
}
