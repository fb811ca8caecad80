//! Cleanup of worktrees and branches left behind by earlier runs.
//!
//! # Orphan Detection
//!
//! A worktree directory is orphaned when no active registry entry that
//! still holds a workspace points at it. That happens when a process dies
//! between allocation and registration, or when the registry was reset by
//! hand. Task branches are kept after release for inspection; once their
//! task is merged or cancelled they can be deleted here.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::TaskStatus;
use crate::git::GitOps;
use crate::registry::{CoordinationRegistry, ListFilter};
use crate::{glog, glog_debug, glog_warn, Result};

/// Configuration for cleanup behavior.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Remove what was detected. When false, only report it.
    pub remove: bool,
    /// Delete branches of merged and cancelled tasks.
    pub delete_finished_branches: bool,
    /// Keep branches of failed tasks for debugging.
    pub keep_failed: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            remove: false,
            delete_finished_branches: false,
            keep_failed: true,
        }
    }
}

/// Report of cleanup operations performed.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Worktree directories not referenced by any live entry.
    pub orphaned: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    /// Worktree admin records dropped because their directory was gone.
    pub pruned: usize,
    /// Branches whose task is finished and no longer needs them.
    pub stale_branches: Vec<String>,
    pub deleted_branches: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.stale_branches.is_empty() && self.pruned == 0
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.orphaned.extend(other.orphaned);
        self.removed.extend(other.removed);
        self.pruned += other.pruned;
        self.stale_branches.extend(other.stale_branches);
        self.deleted_branches.extend(other.deleted_branches);
        self.failed.extend(other.failed);
    }
}

/// Finds and removes leftovers under the worktrees directory and among
/// task branches.
pub struct CleanupManager {
    git: GitOps,
    worktrees_dir: PathBuf,
    branch_prefix: String,
    config: CleanupConfig,
}

impl CleanupManager {
    pub fn new(git: GitOps, worktrees_dir: &Path, branch_prefix: &str, config: CleanupConfig) -> Self {
        Self {
            git,
            worktrees_dir: worktrees_dir.to_path_buf(),
            branch_prefix: branch_prefix.trim_end_matches('/').to_string(),
            config,
        }
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Worktree paths still held by a live task.
    fn held_paths(registry: &CoordinationRegistry) -> HashSet<PathBuf> {
        registry
            .list(&ListFilter::all())
            .into_iter()
            .filter(|entry| entry.status.holds_workspace())
            .filter_map(|entry| entry.workspace.map(|ws| ws.path))
            .collect()
    }

    /// Directories under the worktrees dir that no live entry references.
    pub fn detect_orphaned_worktrees(&self, registry: &CoordinationRegistry) -> Result<Vec<PathBuf>> {
        if !self.worktrees_dir.exists() {
            return Ok(Vec::new());
        }
        let held = Self::held_paths(registry);
        let mut orphans: Vec<PathBuf> = fs::read_dir(&self.worktrees_dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && !held.contains(path))
            .collect();
        orphans.sort();
        glog_debug!("detect_orphaned_worktrees: {} orphan(s)", orphans.len());
        Ok(orphans)
    }

    /// Task branches whose latest entry is finished and holds nothing.
    pub fn detect_stale_branches(&self, registry: &CoordinationRegistry) -> Result<Vec<String>> {
        let mut in_use = HashSet::new();
        let mut finished = HashSet::new();
        for entry in registry.list(&ListFilter::all().including_archived()) {
            let Some(ws) = &entry.workspace else {
                continue;
            };
            let removable = !entry.is_active()
                || match entry.status {
                    TaskStatus::Merged | TaskStatus::Cancelled => true,
                    TaskStatus::Failed => !self.config.keep_failed,
                    _ => false,
                };
            if removable {
                finished.insert(ws.branch.clone());
            } else {
                in_use.insert(ws.branch.clone());
            }
        }
        Ok(self
            .git
            .list_branches(&format!("{}/", self.branch_prefix))?
            .into_iter()
            .filter(|b| finished.contains(b) && !in_use.contains(b))
            .collect())
    }

    /// Remove worktree directories. A failure on one does not stop the rest.
    pub fn remove_orphaned(&self, orphaned: &[PathBuf]) -> CleanupReport {
        let mut report = CleanupReport::new();
        for path in orphaned {
            match self.git.remove_worktree(path) {
                Ok(()) => report.removed.push(path.clone()),
                Err(e) => report
                    .failed
                    .push((path.display().to_string(), e.to_string())),
            }
        }
        report
    }

    pub fn delete_branches(&self, branches: &[String]) -> CleanupReport {
        let mut report = CleanupReport::new();
        for branch in branches {
            match self.git.delete_branch(branch) {
                Ok(()) => report.deleted_branches.push(branch.clone()),
                Err(e) => report.failed.push((branch.clone(), e.to_string())),
            }
        }
        report
    }

    /// Detect everything and, when configured, remove it.
    pub fn run(&self, registry: &CoordinationRegistry) -> Result<CleanupReport> {
        let mut report = CleanupReport::new();
        report.orphaned = self.detect_orphaned_worktrees(registry)?;
        if self.config.delete_finished_branches {
            report.stale_branches = self.detect_stale_branches(registry)?;
        }

        if self.config.remove {
            let removal = self.remove_orphaned(&report.orphaned);
            report.merge(removal);
            match self.git.prune_worktrees() {
                Ok(n) => report.pruned = n,
                Err(e) => glog_warn!("Worktree prune failed: {}", e),
            }
            let deletion = self.delete_branches(&report.stale_branches);
            report.merge(deletion);
        }

        glog!(
            "Cleanup: {} orphaned, {} removed, {} stale branch(es), {} deleted, {} failed",
            report.orphaned.len(),
            report.removed.len(),
            report.stale_branches.len(),
            report.deleted_branches.len(),
            report.failed.len()
        );
        Ok(report)
    }
}
