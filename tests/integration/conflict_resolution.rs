//! Merge ordering and conflict handling.

use std::fs;

use grove::core::{TaskSpec, TaskStatus};
use grove::orchestration::SchedulerEvent;
use grove::Error;

use crate::fixtures::{id, SchedulerHarness, TestRepo};

/// Run three independent tasks whose completion signals arrive in
/// `signal_order`; return the merge order and the resulting target history.
async fn merge_order_for(signal_order: &[&str]) -> (Vec<String>, Vec<String>) {
    let mut h = SchedulerHarness::new(4);
    h.scheduler
        .submit(&[
            TaskSpec::new("gamma", &[]),
            TaskSpec::new("alpha", &[]),
            TaskSpec::new("beta", &[]),
        ])
        .unwrap();
    h.tick().await;
    for task in signal_order {
        h.complete_default(task);
    }
    let report = h.tick().await;
    let merged = report.merged.iter().map(|t| t.to_string()).collect();
    // Branch names carry a random suffix; compare subjects without it
    let history = h
        .repo
        .target_history()
        .into_iter()
        .map(|s| s.split(" (").next().unwrap_or("").to_string())
        .collect();
    (merged, history)
}

/// Given several tasks completing in the same tick
/// When they are merged
/// Then they land in declaration order regardless of signal arrival
#[tokio::test]
async fn test_merge_order_is_declaration_order() {
    let (first, first_history) = merge_order_for(&["beta", "alpha", "gamma"]).await;
    let (second, second_history) = merge_order_for(&["gamma", "beta", "alpha"]).await;

    assert_eq!(first, vec!["gamma", "alpha", "beta"]);
    assert_eq!(first, second);
    assert_eq!(first_history, second_history);
}

/// Given two tasks editing the same line
/// When both complete
/// Then the first merges, the second stays completed with its workspace
/// intact, and the target branch is unchanged by the failed attempt
#[tokio::test]
async fn test_conflict_keeps_workspace_and_target() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler
        .submit(&[
            TaskSpec::new("first", &[]),
            TaskSpec::new("second", &[]),
            TaskSpec::new("after", &["second"]),
        ])
        .unwrap();
    h.tick().await;

    h.complete("first", "README.md", "# Written by first\n");
    h.complete("second", "README.md", "# Written by second\n");
    let report = h.tick().await;
    assert_eq!(report.merged, vec![id("first")]);
    assert_eq!(report.conflicts, vec![id("second")]);

    assert_eq!(h.scheduler.status(&id("second")), Some(TaskStatus::Completed));
    assert_eq!(h.scheduler.status(&id("after")), Some(TaskStatus::Pending));
    assert_eq!(
        h.repo.target_file("README.md"),
        Some("# Written by first\n".to_string())
    );
    let workspace = h.workspace_of("second");
    assert_eq!(
        fs::read_to_string(workspace.join("README.md")).unwrap(),
        "# Written by second\n"
    );

    let conflict = h
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            SchedulerEvent::MergeConflict { task_id, files } => Some((task_id, files)),
            _ => None,
        })
        .expect("conflict event");
    assert_eq!(conflict.0, id("second"));
    assert_eq!(conflict.1, vec![std::path::PathBuf::from("README.md")]);

    let entry = h.scheduler.registry().query(&id("second")).unwrap();
    assert!(entry.summary.unwrap().contains("README.md"));
}

/// Given a conflicted task
/// When the operator reconciles the file in its workspace and retries
/// Then it merges and its dependents proceed
#[tokio::test]
async fn test_resolved_conflict_merges_on_retry() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler
        .submit(&[
            TaskSpec::new("first", &[]),
            TaskSpec::new("second", &[]),
            TaskSpec::new("after", &["second"]),
        ])
        .unwrap();
    h.tick().await;
    h.complete("first", "README.md", "# Written by first\n");
    h.complete("second", "README.md", "# Written by second\n");
    h.tick().await;

    // A conflicted task is not retried on its own
    let report = h.tick().await;
    assert!(report.conflicts.is_empty() && report.merged.is_empty());
    assert!(h.scheduler.is_stalled());

    let still = h.scheduler.retry_merge(&id("second")).await.unwrap_err();
    assert!(matches!(still, Error::MergeConflict { .. }));

    // Resolve: take the target's version of the file, keep second's other work
    let workspace = h.workspace_of("second");
    fs::write(workspace.join("README.md"), "# Written by first\n").unwrap();
    fs::write(workspace.join("second.txt"), "second\n").unwrap();

    let outcome = h.scheduler.retry_merge(&id("second")).await.unwrap();
    assert!(!outcome.fast_forward);
    assert_eq!(h.scheduler.status(&id("second")), Some(TaskStatus::Merged));
    assert_eq!(h.repo.target_file("second.txt"), Some("second\n".to_string()));
    assert!(h.scheduler.conflicted().is_empty());

    let report = h.tick().await;
    assert_eq!(report.assigned, vec![id("after")]);
}

#[tokio::test]
async fn test_retry_merge_requires_completed_task() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler.submit(&[TaskSpec::new("a", &[])]).unwrap();
    h.tick().await;
    let err = h.scheduler.retry_merge(&id("a")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

/// Given work already on the target when the workflow starts
/// When a task is allocated
/// Then its workspace is based on the target tip, not on HEAD alone
#[tokio::test]
async fn test_workspace_based_on_target_tip() {
    let repo = TestRepo::new();
    let git = repo.git_ops();
    git.ensure_branch(crate::fixtures::TARGET_BRANCH).unwrap();
    // HEAD moves on; the target stays behind
    repo.create_and_commit("later.txt", "later\n", "Work on main");

    let mut h = SchedulerHarness::with_config(repo, |_| {});
    h.scheduler.submit(&[TaskSpec::new("a", &[])]).unwrap();
    h.tick().await;
    assert!(!h.workspace_of("a").join("later.txt").exists());
}
