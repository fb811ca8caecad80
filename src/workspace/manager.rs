use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::core::TaskId;
use crate::git::GitOps;
use crate::util::sanitize_component;
use crate::workspace::{Workspace, WorkspaceId, WorkspaceState};
use crate::{glog, glog_debug, glog_warn, Error, Result};

/// Owns the lifecycle of every workspace. The only writer of
/// [`WorkspaceState`].
///
/// Allocation reserves a quota slot under the lock and performs the git
/// work outside it, so concurrent callers never exceed `max_concurrent`.
pub struct WorkspaceManager {
    git: GitOps,
    worktrees_dir: PathBuf,
    branch_prefix: String,
    max_concurrent: usize,
    workspaces: Mutex<HashMap<WorkspaceId, Workspace>>,
    /// Serializes worktree admin writes in the shared `.git` directory.
    git_lock: Mutex<()>,
    /// Released worktrees whose directory could not be removed yet.
    pending_removal: Mutex<Vec<PathBuf>>,
}

impl WorkspaceManager {
    pub fn new(
        git: GitOps,
        worktrees_dir: &Path,
        branch_prefix: &str,
        max_concurrent: usize,
    ) -> Self {
        Self {
            git,
            worktrees_dir: worktrees_dir.to_path_buf(),
            branch_prefix: branch_prefix.trim_end_matches('/').to_string(),
            max_concurrent,
            workspaces: Mutex::new(HashMap::new()),
            git_lock: Mutex::new(()),
            pending_removal: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkspaceId, Workspace>> {
        self.workspaces.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn git(&self) -> &GitOps {
        &self.git
    }

    pub fn worktrees_dir(&self) -> &Path {
        &self.worktrees_dir
    }

    /// Carve a fresh worktree for `task_id` from `base_revision`.
    pub fn allocate(&self, task_id: &TaskId, base_revision: &str) -> Result<Workspace> {
        let base = self.git.resolve(base_revision).map_err(|e| {
            Error::Allocation(format!(
                "cannot resolve base revision '{}' for task {}: {}",
                base_revision, task_id, e
            ))
        })?;

        let id = WorkspaceId::new();
        let dir_name = format!("{}-{}", sanitize_component(task_id.as_str()), id.short());
        let workspace = Workspace {
            id,
            task_id: task_id.clone(),
            path: self.worktrees_dir.join(&dir_name),
            branch: format!("{}/{}", self.branch_prefix, dir_name),
            base_revision: base.clone(),
            state: WorkspaceState::Allocated,
            deadline: None,
            created_at: Utc::now(),
        };

        {
            let mut workspaces = self.lock();
            if workspaces
                .values()
                .any(|ws| ws.task_id == *task_id && !ws.is_released())
            {
                return Err(Error::Duplicate(format!(
                    "task {} already holds a workspace",
                    task_id
                )));
            }
            let live = workspaces.values().filter(|ws| ws.state.is_live()).count();
            if live >= self.max_concurrent {
                return Err(Error::Allocation(format!(
                    "concurrency quota exhausted ({} of {} workspaces live)",
                    live, self.max_concurrent
                )));
            }
            workspaces.insert(id, workspace.clone());
        }

        let created = {
            let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.git
                .create_worktree(&workspace.branch, &workspace.path, &base)
        };
        if let Err(e) = created {
            glog_warn!("Worktree creation failed for {}: {}", task_id, e);
            self.lock().remove(&id);
            let _ = self.git.delete_branch(&workspace.branch);
            if workspace.path.exists() {
                let _ = std::fs::remove_dir_all(&workspace.path);
            }
            return Err(Error::Allocation(format!(
                "cannot create worktree for task {}: {}",
                task_id, e
            )));
        }

        glog!(
            "Allocated workspace {} for {} at {} (branch {})",
            id.short(),
            task_id,
            workspace.path.display(),
            workspace.branch
        );
        Ok(workspace)
    }

    fn transition(&self, id: WorkspaceId, next: WorkspaceState) -> Result<Workspace> {
        let mut workspaces = self.lock();
        let ws = workspaces
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("workspace {}", id)))?;
        if ws.state == next {
            return Ok(ws.clone());
        }
        if !ws.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                task_id: ws.task_id.clone(),
                from: ws.state.to_string(),
                to: next.to_string(),
            });
        }
        glog_debug!("Workspace {}: {} -> {}", id.short(), ws.state, next);
        ws.state = next;
        Ok(ws.clone())
    }

    pub fn activate(&self, id: WorkspaceId) -> Result<Workspace> {
        self.transition(id, WorkspaceState::Active)
    }

    pub fn mark_pending_merge(&self, id: WorkspaceId) -> Result<Workspace> {
        self.transition(id, WorkspaceState::PendingMerge)
    }

    /// Remove the worktree. Releasing twice is a no-op; the branch is kept.
    ///
    /// The quota slot is freed even when the directory cannot be removed;
    /// such paths are queued for [`Self::retry_pending_removals`].
    pub fn release(&self, id: WorkspaceId) -> Result<()> {
        let workspace = {
            let workspaces = self.lock();
            let ws = workspaces
                .get(&id)
                .ok_or_else(|| Error::NotFound(format!("workspace {}", id)))?;
            if ws.is_released() {
                glog_debug!("Workspace {} already released", id.short());
                return Ok(());
            }
            ws.clone()
        };

        let removed = {
            let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.git.remove_worktree(&workspace.path)
        };
        self.transition(id, WorkspaceState::Released)?;
        if let Err(e) = removed {
            glog_warn!(
                "Could not remove worktree {} for {}, will retry: {}",
                workspace.path.display(),
                workspace.task_id,
                e
            );
            self.pending_removal
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(workspace.path.clone());
        }
        glog!(
            "Released workspace {} for {}",
            id.short(),
            workspace.task_id
        );
        Ok(())
    }

    /// Try again to remove worktrees left behind by a failed release.
    /// Returns how many are still pending.
    pub fn retry_pending_removals(&self) -> usize {
        let paths = std::mem::take(
            &mut *self
                .pending_removal
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        let mut still_pending = Vec::new();
        for path in paths {
            let removed = {
                let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
                self.git.remove_worktree(&path)
            };
            match removed {
                Ok(()) => glog!("Removed leftover worktree {}", path.display()),
                Err(e) => {
                    glog_debug!("Worktree {} still not removable: {}", path.display(), e);
                    still_pending.push(path);
                }
            }
        }
        let mut pending = self
            .pending_removal
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        pending.extend(still_pending);
        pending.len()
    }

    pub fn pending_removals(&self) -> Vec<PathBuf> {
        self.pending_removal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-attach a workspace recorded before a restart. Live workspaces
    /// need their directory; pending-merge ones only need the branch.
    pub fn adopt(&self, workspace: Workspace) -> Result<()> {
        if workspace.state.is_live() && !workspace.path.exists() {
            return Err(Error::NotFound(format!(
                "workspace directory {} is gone",
                workspace.path.display()
            )));
        }
        let mut workspaces = self.lock();
        if workspaces
            .values()
            .any(|ws| ws.task_id == workspace.task_id && !ws.is_released() && ws.id != workspace.id)
        {
            return Err(Error::Duplicate(format!(
                "task {} already holds a workspace",
                workspace.task_id
            )));
        }
        glog_debug!(
            "Adopted workspace {} for {} ({})",
            workspace.id.short(),
            workspace.task_id,
            workspace.state
        );
        workspaces.insert(workspace.id, workspace);
        Ok(())
    }

    pub fn set_deadline(&self, id: WorkspaceId, deadline: Option<DateTime<Utc>>) -> Result<()> {
        let mut workspaces = self.lock();
        let ws = workspaces
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("workspace {}", id)))?;
        ws.deadline = deadline;
        Ok(())
    }

    pub fn get(&self, id: WorkspaceId) -> Option<Workspace> {
        self.lock().get(&id).cloned()
    }

    /// The task's non-released workspace, if any.
    pub fn current_for(&self, task_id: &TaskId) -> Option<Workspace> {
        self.lock()
            .values()
            .find(|ws| ws.task_id == *task_id && !ws.is_released())
            .cloned()
    }

    pub fn locate(&self, task_id: &TaskId) -> Result<PathBuf> {
        self.current_for(task_id)
            .map(|ws| ws.path)
            .ok_or_else(|| Error::NotFound(format!("no workspace for task {}", task_id)))
    }

    /// All known workspaces, oldest first.
    pub fn list(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Workspaces counting against the quota.
    pub fn live_count(&self) -> usize {
        self.lock().values().filter(|ws| ws.state.is_live()).count()
    }

    pub fn capacity(&self) -> usize {
        self.max_concurrent
    }

    pub fn has_capacity(&self) -> bool {
        self.live_count() < self.max_concurrent
    }
}
