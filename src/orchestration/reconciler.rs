//! Integration of finished workspaces into the target branch.
//!
//! The reconciler is the only writer of the target branch. Merges happen
//! in memory against the branch refs, so no checkout is ever touched and a
//! conflicting merge leaves the target exactly as it was.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::core::TaskId;
use crate::git::{BranchMerge, GitOps};
use crate::util::blocking;
use crate::workspace::Workspace;
use crate::{glog, glog_debug, glog_warn, Error, Result};

/// Successful integration of one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub task_id: TaskId,
    /// Target tip after the merge.
    pub commit: String,
    pub fast_forward: bool,
    /// Paths the task changed relative to its base revision.
    pub changed_paths: Vec<PathBuf>,
    /// Earlier tasks in the same batch that touched some of the same paths.
    pub overlaps_with: Vec<TaskId>,
}

/// Per-task results of [`Reconciler::merge_all`], in the order given.
pub type MergeResults = Vec<(TaskId, Result<MergeOutcome>)>;

pub struct Reconciler {
    git: Arc<GitOps>,
    target_branch: String,
    auto_commit: bool,
    /// Held while writing the target branch.
    target_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(git: GitOps, target_branch: &str, auto_commit: bool) -> Self {
        if let Ok(Some(current)) = git.current_branch() {
            if current == target_branch {
                glog_warn!(
                    "Target branch {} is checked out; its working tree will lag behind merges",
                    target_branch
                );
            }
        }
        Self {
            git: Arc::new(git),
            target_branch: target_branch.to_string(),
            auto_commit,
            target_lock: Mutex::new(()),
        }
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    /// Tip of the target branch; creates it from HEAD on first use.
    pub async fn target_revision(&self) -> Result<String> {
        let git = Arc::clone(&self.git);
        let target = self.target_branch.clone();
        blocking(move || git.ensure_branch(&target)).await
    }

    /// Commit stray changes (if enabled) and list what the task touched.
    async fn analyze(&self, workspace: &Workspace) -> Result<Vec<PathBuf>> {
        let git = Arc::clone(&self.git);
        let ws = workspace.clone();
        let auto_commit = self.auto_commit;
        blocking(move || {
            if auto_commit && ws.path.exists() && git.is_dirty(&ws.path)? {
                glog!("Auto-committing uncommitted changes for {}", ws.task_id);
                git.commit_all(&ws.path, &format!("grove: uncommitted work for {}", ws.task_id))?;
            }
            git.changed_paths(&ws.base_revision, &ws.branch)
        })
        .await
    }

    async fn integrate(&self, workspace: &Workspace, changed_paths: Vec<PathBuf>) -> Result<MergeOutcome> {
        let git = Arc::clone(&self.git);
        let target = self.target_branch.clone();
        let source = workspace.branch.clone();
        let message = format!("Merge task {} ({})", workspace.task_id, workspace.branch);
        let result = blocking(move || {
            git.ensure_branch(&target)?;
            git.merge_branch(&target, &source, &message)
        })
        .await?;

        let task_id = workspace.task_id.clone();
        let (commit, fast_forward) = match result {
            BranchMerge::UpToDate { commit } | BranchMerge::Merged { commit } => (commit, false),
            BranchMerge::FastForward { commit } => (commit, true),
            BranchMerge::Conflicted { files } => {
                glog_warn!(
                    "Merge conflict for {} in {} file(s): {:?}",
                    task_id,
                    files.len(),
                    files
                );
                return Err(Error::MergeConflict { task_id, files });
            }
        };
        glog!(
            "Merged {} into {} at {}{}",
            task_id,
            self.target_branch,
            &commit[..commit.len().min(8)],
            if fast_forward { " (fast-forward)" } else { "" }
        );
        Ok(MergeOutcome {
            task_id,
            commit,
            fast_forward,
            changed_paths,
            overlaps_with: Vec::new(),
        })
    }

    /// Integrate a single workspace branch into the target.
    pub async fn merge(&self, workspace: &Workspace) -> Result<MergeOutcome> {
        let changed = self.analyze(workspace).await?;
        let _target = self.target_lock.lock().await;
        self.integrate(workspace, changed).await
    }

    /// Integrate a batch. Analysis runs concurrently; commits to the target
    /// happen one at a time in the order given.
    pub async fn merge_all(&self, workspaces: &[Workspace]) -> MergeResults {
        glog_debug!("merge_all: {} candidate(s)", workspaces.len());
        let analyses = join_all(workspaces.iter().map(|ws| self.analyze(ws))).await;

        let _target = self.target_lock.lock().await;
        let mut merged_paths: Vec<(TaskId, HashSet<PathBuf>)> = Vec::new();
        let mut results = Vec::with_capacity(workspaces.len());

        for (ws, analysis) in workspaces.iter().zip(analyses) {
            let changed = match analysis {
                Ok(changed) => changed,
                Err(e) => {
                    glog_warn!("Could not analyze {}: {}", ws.task_id, e);
                    results.push((ws.task_id.clone(), Err(e)));
                    continue;
                }
            };
            let overlaps: Vec<TaskId> = merged_paths
                .iter()
                .filter(|(_, paths)| changed.iter().any(|p| paths.contains(p)))
                .map(|(id, _)| id.clone())
                .collect();

            let result = self.integrate(ws, changed.clone()).await.map(|mut outcome| {
                if !overlaps.is_empty() {
                    glog_debug!("{} overlaps earlier merges: {:?}", ws.task_id, overlaps);
                }
                outcome.overlaps_with = overlaps;
                outcome
            });
            if result.is_ok() {
                merged_paths.push((ws.task_id.clone(), changed.into_iter().collect()));
            }
            results.push((ws.task_id.clone(), result));
        }
        results
    }
}
