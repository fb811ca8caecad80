//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Building a scheduler whose state lives next to the repository
//! - Simulating workers through signals

use std::fs;
use std::path::{Path, PathBuf};

use git2::{Repository, Signature};
use tempfile::TempDir;
use tokio::sync::mpsc;

use grove::config::OrchestratorConfig;
use grove::core::{TaskId, TaskSpec};
use grove::git::GitOps;
use grove::orchestration::{Scheduler, SchedulerEvent, TickReport};

pub const TARGET_BRANCH: &str = "integration";

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// Holds the repo and, beside it, the grove state directory.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        fs::create_dir_all(&path).expect("Failed to create repo dir");
        Repository::init(&path).expect("Failed to init git");

        let repo = Self { temp_dir, path };
        repo.create_and_commit("README.md", "# Test Repository\n", "Initial commit");
        repo
    }

    /// Write a file on the checked-out branch and commit it.
    pub fn create_and_commit(&self, filename: &str, content: &str, message: &str) -> String {
        let repo = Repository::open(&self.path).expect("Failed to open repo");
        let file_path = self.path.join(filename);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        fs::write(&file_path, content).expect("Failed to write file");

        let mut index = repo.index().unwrap();
        index.add_path(Path::new(filename)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test User", "test@test.com").unwrap();
        let parents = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().unwrap()],
            Err(_) => Vec::new(),
        };
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .unwrap()
            .to_string()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.temp_dir.path().join("state")
    }

    /// Get GitOps for this repository.
    pub fn git_ops(&self) -> GitOps {
        GitOps::new(&self.path).expect("Failed to open GitOps")
    }

    /// File content at the tip of the target branch.
    pub fn target_file(&self, path: &str) -> Option<String> {
        self.git_ops()
            .read_file_at(TARGET_BRANCH, Path::new(path))
            .expect("Failed to read target branch")
    }

    /// Commit subjects on the target branch, oldest first, following
    /// first parents.
    pub fn target_history(&self) -> Vec<String> {
        let repo = Repository::open(&self.path).unwrap();
        let mut commit = repo
            .find_branch(TARGET_BRANCH, git2::BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap();
        let mut subjects = vec![commit.summary().unwrap_or("").to_string()];
        while let Ok(parent) = commit.parent(0) {
            subjects.push(parent.summary().unwrap_or("").to_string());
            commit = parent;
        }
        subjects.reverse();
        subjects
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

pub fn id(s: &str) -> TaskId {
    TaskId::from(s)
}

/// Diamond: `base` feeds `left` and `right`, both feed `top`.
///
/// ```text
///        base
///       /    \
///    left    right
///       \    /
///        top
/// ```
pub fn diamond() -> Vec<TaskSpec> {
    vec![
        TaskSpec::new("base", &[]),
        TaskSpec::new("left", &["base"]),
        TaskSpec::new("right", &["base"]),
        TaskSpec::new("top", &["left", "right"]),
    ]
}

pub fn independent(count: usize) -> Vec<TaskSpec> {
    (0..count)
        .map(|i| TaskSpec::new(&format!("task-{}", i), &[]))
        .collect()
}

/// Test harness for scheduler tests.
pub struct SchedulerHarness {
    pub scheduler: Scheduler,
    pub event_rx: mpsc::Receiver<SchedulerEvent>,
    pub repo: TestRepo,
}

impl SchedulerHarness {
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_config(TestRepo::new(), |config| config.max_concurrent = max_concurrent)
    }

    pub fn with_config(repo: TestRepo, tweak: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        let mut config = OrchestratorConfig {
            state_dir: Some(repo.state_dir().to_string_lossy().to_string()),
            target_branch: TARGET_BRANCH.to_string(),
            ..Default::default()
        };
        tweak(&mut config);
        let (event_tx, event_rx) = mpsc::channel(1000);
        let scheduler =
            Scheduler::open(config, &repo.path, event_tx).expect("Failed to open scheduler");
        Self {
            scheduler,
            event_rx,
            repo,
        }
    }

    /// Stop the scheduler, keeping the repository and state on disk.
    pub fn shutdown(self) -> TestRepo {
        let Self { scheduler, repo, .. } = self;
        drop(scheduler);
        repo
    }

    /// Simulate a process restart: same repo, same state directory.
    pub fn restart(self) -> Self {
        let max = self.scheduler.config().max_concurrent;
        Self::with_config(self.shutdown(), |config| config.max_concurrent = max)
    }

    pub async fn tick(&mut self) -> TickReport {
        self.scheduler.tick().await.expect("tick failed")
    }

    pub fn workspace_of(&self, task: &str) -> PathBuf {
        self.scheduler
            .workspaces()
            .locate(&id(task))
            .expect("task has no workspace")
    }

    /// Act as the worker: write `file` in the task's workspace and report
    /// success.
    pub fn complete(&self, task: &str, file: &str, content: &str) {
        let path = self.workspace_of(task).join(file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
        self.scheduler
            .signal_sender()
            .success(&id(task), &format!("wrote {}", file))
            .unwrap();
    }

    /// Complete with a file named after the task.
    pub fn complete_default(&self, task: &str) {
        self.complete(task, &format!("{}.txt", task), &format!("{}\n", task));
    }

    pub fn fail(&self, task: &str, reason: &str) {
        self.scheduler
            .signal_sender()
            .failure(&id(task), reason)
            .unwrap();
    }

    pub fn drain_events(&mut self) -> Vec<SchedulerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}
