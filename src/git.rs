use std::fs;
use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Oid, Repository, Signature};

use crate::{glog_debug, glog_warn, Result};

/// Result of integrating one branch into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchMerge {
    /// Target already contains the source.
    UpToDate { commit: String },
    /// Target ref moved forward to the source tip.
    FastForward { commit: String },
    /// A two-parent merge commit was written to the target.
    Merged { commit: String },
    /// Three-way merge produced conflicts; nothing was written.
    Conflicted { files: Vec<PathBuf> },
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        glog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::discover(repo_path)?;
        // Anchor at the working directory so worktree paths resolve the same
        // way no matter which subdirectory we were started from.
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("Grove", "grove@localhost"))?)
    }

    /// Resolve any revision expression to a full commit id.
    pub fn resolve(&self, revision: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.revparse_single(revision)?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let head = repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Short name of the branch checked out in the main worktree, if any.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if head.is_branch() {
            Ok(head.shorthand().map(String::from))
        } else {
            Ok(None)
        }
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Tip commit of `branch`, creating the branch from HEAD if it is missing.
    pub fn ensure_branch(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let tip = match repo.find_branch(branch, BranchType::Local) {
            Ok(existing) => existing.get().peel_to_commit()?,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let head_commit = repo.head()?.peel_to_commit()?;
                glog_debug!("Creating branch {} from HEAD {}", branch, head_commit.id());
                repo.branch(branch, &head_commit, false)?;
                head_commit
            }
            Err(e) => return Err(e.into()),
        };
        Ok(tip.id().to_string())
    }

    pub fn branch_tip(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Create `branch` at `base` and check it out in a new worktree.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path, base: &str) -> Result<()> {
        glog_debug!(
            "GitOps::create_worktree branch={} path={} base={}",
            branch,
            worktree_path.display(),
            base
        );
        let repo = self.repo()?;
        let commit = repo.find_commit(Oid::from_str(base)?)?;
        let branch_obj = repo.branch(branch, &commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));

        if let Some(parent) = worktree_path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Use the folder name as the worktree name (branch may contain slashes)
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        glog_debug!("Worktree {} created", worktree_name);
        Ok(())
    }

    /// Remove a worktree directory and its admin data under `.git/worktrees`.
    /// The branch survives.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        glog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        // Match by recorded path first, folder name as fallback
        let worktree_name = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
            })
            .map(String::from)
            .or_else(|| {
                folder_name.as_ref().and_then(|fname| {
                    worktrees
                        .iter()
                        .flatten()
                        .find(|name| *name == fname.as_str())
                        .map(String::from)
                })
            });

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    glog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            fs::remove_dir_all(worktree_path)?;
        }

        // If the admin dir survives, git still considers the branch checked out
        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                glog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Registered worktrees as `(name, path)`.
    pub fn list_worktrees(&self) -> Result<Vec<(String, PathBuf)>> {
        let repo = self.repo()?;
        let names = repo.worktrees()?;
        Ok(names
            .iter()
            .flatten()
            .filter_map(|name| {
                repo.find_worktree(name)
                    .ok()
                    .map(|wt| (name.to_string(), wt.path().to_path_buf()))
            })
            .collect())
    }

    /// Drop admin data for worktrees whose directories are gone.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists() && wt.prune(None).is_ok() {
                    pruned += 1;
                }
            }
        }
        glog_debug!("prune_worktrees: pruned {} worktrees", pruned);
        Ok(pruned)
    }

    /// Local branch names starting with `prefix`, sorted.
    pub fn list_branches(&self, prefix: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let mut names = Vec::new();
        for branch in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()? {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a local branch. Missing branches are not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        glog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    glog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => glog_warn!("Error looking up branch '{}': {}", branch, e),
        }
        Ok(())
    }

    /// Stage everything in the worktree and commit it. Returns the new commit id.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String> {
        glog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(commit_id.to_string())
    }

    /// True if the worktree has staged or unstaged changes.
    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Paths touched between `base` and the tip of `branch`.
    pub fn changed_paths(&self, base: &str, branch: &str) -> Result<Vec<PathBuf>> {
        let repo = self.repo()?;
        let base_tree = repo.find_commit(Oid::from_str(base)?)?.tree()?;
        let tip_tree = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .tree()?;
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&tip_tree), None)?;
        let mut paths: Vec<PathBuf> = diff
            .deltas()
            .filter_map(|delta| {
                delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map(Path::to_path_buf)
            })
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Integrate `source` into `target` without touching any checkout.
    ///
    /// Fast-forwards when possible, otherwise merges in memory and commits
    /// straight to `refs/heads/<target>`. On conflict nothing is written.
    pub fn merge_branch(&self, target: &str, source: &str, message: &str) -> Result<BranchMerge> {
        let repo = self.repo()?;
        let target_commit = repo
            .find_branch(target, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let source_commit = repo
            .find_branch(source, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let (ours, theirs) = (target_commit.id(), source_commit.id());
        let refname = format!("refs/heads/{}", target);

        if ours == theirs || repo.graph_descendant_of(ours, theirs)? {
            return Ok(BranchMerge::UpToDate {
                commit: ours.to_string(),
            });
        }

        if repo.graph_descendant_of(theirs, ours)? {
            repo.reference_matching(
                &refname,
                theirs,
                true,
                ours,
                &format!("grove: fast-forward {} to {}", target, source),
            )?;
            return Ok(BranchMerge::FastForward {
                commit: theirs.to_string(),
            });
        }

        let mut index = repo.merge_commits(&target_commit, &source_commit, None)?;
        if index.has_conflicts() {
            let mut files: Vec<PathBuf> = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(entry) = conflict
                    .our
                    .as_ref()
                    .or(conflict.their.as_ref())
                    .or(conflict.ancestor.as_ref())
                {
                    files.push(PathBuf::from(
                        String::from_utf8_lossy(&entry.path).to_string(),
                    ));
                }
            }
            files.sort();
            files.dedup();
            return Ok(BranchMerge::Conflicted { files });
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let commit_id = repo.commit(
            Some(&refname),
            &sig,
            &sig,
            message,
            &tree,
            &[&target_commit, &source_commit],
        )?;
        Ok(BranchMerge::Merged {
            commit: commit_id.to_string(),
        })
    }

    /// Read a file as it exists at the tip of `branch`.
    pub fn read_file_at(&self, branch: &str, path: &Path) -> Result<Option<String>> {
        let repo = self.repo()?;
        let tree = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .tree()?;
        let entry = match tree.get_path(path) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = repo.find_blob(entry.id())?;
        Ok(Some(String::from_utf8_lossy(blob.content()).to_string()))
    }
}
