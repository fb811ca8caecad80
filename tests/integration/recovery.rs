//! Restart, requeue, deadline and cancellation behavior.

use std::fs;
use std::time::Duration;

use grove::core::{TaskSpec, TaskStatus};
use grove::orchestration::signal::write_signal_file;
use grove::orchestration::{CancelOutcome, ExecutionSignal};
use grove::registry::{CoordinationRegistry, EntryUpdate, ListFilter};
use grove::Error;

use crate::fixtures::{diamond, id, SchedulerHarness};

/// Given a workflow interrupted mid-run
/// When the orchestrator restarts on the same state directory
/// Then merged work stays merged, running work is re-attached, and the
/// run completes
#[tokio::test]
async fn test_restart_resumes_from_registry() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler.submit(&diamond()).unwrap();
    h.tick().await;
    h.complete_default("base");
    h.tick().await;
    h.scheduler.signal_sender().started(&id("left")).unwrap();
    h.complete_default("right");
    h.tick().await;
    let left_path = h.workspace_of("left");

    let mut h = h.restart();
    h.scheduler.submit(&diamond()).unwrap();
    assert_eq!(h.scheduler.status(&id("base")), Some(TaskStatus::Merged));
    assert_eq!(h.scheduler.status(&id("right")), Some(TaskStatus::Merged));
    assert_eq!(h.scheduler.status(&id("left")), Some(TaskStatus::InProgress));
    assert_eq!(h.scheduler.status(&id("top")), Some(TaskStatus::Pending));
    assert_eq!(h.workspace_of("left"), left_path);

    // Nothing is re-assigned on the first tick after restart
    let report = h.tick().await;
    assert!(report.assigned.is_empty());

    h.complete_default("left");
    let report = h.tick().await;
    assert_eq!(report.merged, vec![id("left")]);
    assert_eq!(report.assigned, vec![id("top")]);
    h.complete_default("top");
    h.tick().await;
    assert!(h.scheduler.is_finished());
}

/// A completed task whose merge was interrupted merges after restart.
#[tokio::test]
async fn test_restart_merges_completed_work() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler.submit(&[TaskSpec::new("a", &[])]).unwrap();
    h.tick().await;
    h.scheduler.signal_sender().started(&id("a")).unwrap();
    h.tick().await;
    fs::write(h.workspace_of("a").join("a.txt"), "a\n").unwrap();

    // Crash between recording completion and merging
    let repo = h.shutdown();
    CoordinationRegistry::open(&repo.state_dir().join("registry.jsonl"))
        .unwrap()
        .update(&id("a"), EntryUpdate::status(TaskStatus::Completed))
        .unwrap();

    let mut h = SchedulerHarness::with_config(repo, |_| {});
    h.scheduler.submit(&[TaskSpec::new("a", &[])]).unwrap();
    assert_eq!(h.scheduler.status(&id("a")), Some(TaskStatus::Completed));
    let report = h.tick().await;
    assert_eq!(report.merged, vec![id("a")]);
    assert_eq!(h.repo.target_file("a.txt"), Some("a\n".to_string()));
}

/// Given a running task whose workspace vanished while grove was down
/// When grove restarts
/// Then the task is failed rather than left hanging
#[tokio::test]
async fn test_lost_workspace_fails_task_on_restart() {
    let mut h = SchedulerHarness::new(4);
    let specs = vec![TaskSpec::new("a", &[]), TaskSpec::new("b", &["a"])];
    h.scheduler.submit(&specs).unwrap();
    h.tick().await;
    let path = h.workspace_of("a");

    let repo = h.shutdown();
    fs::remove_dir_all(&path).unwrap();

    let mut h = SchedulerHarness::with_config(repo, |_| {});
    h.scheduler.submit(&specs).unwrap();
    assert_eq!(h.scheduler.status(&id("a")), Some(TaskStatus::Failed));

    let report = h.tick().await;
    assert_eq!(report.failed, vec![id("b")]);
    assert!(report.assigned.is_empty());
}

/// Given a failed task and its propagated failures
/// When the task is requeued
/// Then it and its dependents run again with a fresh workspace and a
/// bumped attempt number
#[tokio::test]
async fn test_requeue_after_failure() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler
        .submit(&[TaskSpec::new("a", &[]), TaskSpec::new("b", &["a"])])
        .unwrap();
    h.tick().await;
    let first_path = h.workspace_of("a");
    h.fail("a", "flaky test");
    h.tick().await;
    assert_eq!(h.scheduler.status(&id("b")), Some(TaskStatus::Failed));
    assert!(!first_path.exists());

    let restored = h.scheduler.requeue(&id("a")).unwrap();
    assert_eq!(restored, vec![id("a"), id("b")]);

    let report = h.tick().await;
    assert_eq!(report.assigned, vec![id("a")]);
    assert_ne!(h.workspace_of("a"), first_path);
    assert_eq!(h.scheduler.registry().query(&id("a")).unwrap().attempt, 2);

    h.complete_default("a");
    let report = h.tick().await;
    assert_eq!(report.merged, vec![id("a")]);
    assert_eq!(report.assigned, vec![id("b")]);

    let archived = h
        .scheduler
        .registry()
        .list(&ListFilter::all().including_archived());
    assert!(archived.iter().any(|e| e.task_id == id("a") && e.archived));
}

/// Given a task that outlives its deadline
/// When the scheduler ticks
/// Then the task fails with a deadline reason and its workspace is freed
#[tokio::test]
async fn test_deadline_expiry() {
    let mut h = SchedulerHarness::with_config(crate::fixtures::TestRepo::new(), |config| {
        config.default_deadline_secs = Some(0);
    });
    h.scheduler
        .submit(&[TaskSpec::new("slow", &[]), TaskSpec::new("patient", &[]).with_deadline_secs(3600)])
        .unwrap();
    h.tick().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = h.tick().await;
    assert_eq!(report.expired, vec![id("slow")]);
    assert_eq!(h.scheduler.status(&id("patient")), Some(TaskStatus::Assigned));
    let entry = h.scheduler.registry().query(&id("slow")).unwrap();
    assert_eq!(entry.status, TaskStatus::Failed);
    assert!(entry.summary.unwrap().contains("deadline"));
    assert_eq!(h.scheduler.workspaces().live_count(), 1);

    // A late success from the expired worker is ignored
    h.scheduler
        .signal_sender()
        .success(&id("slow"), "finally")
        .unwrap();
    let report = h.tick().await;
    assert!(report.merged.is_empty());
    assert_eq!(h.scheduler.status(&id("slow")), Some(TaskStatus::Failed));
}

/// Cancellation arriving as a signal file, the way `grove cancel` sends it.
#[tokio::test]
async fn test_cancel_via_signal_file() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler
        .submit(&[TaskSpec::new("a", &[]), TaskSpec::new("b", &["a"])])
        .unwrap();
    h.tick().await;

    let signals = h.scheduler.config().signals_dir().unwrap();
    write_signal_file(&signals, &ExecutionSignal::cancel("b")).unwrap();
    let report = h.tick().await;
    assert_eq!(report.cancelled, vec![id("b")]);
    assert_eq!(h.scheduler.status(&id("b")), Some(TaskStatus::Cancelled));

    write_signal_file(&signals, &ExecutionSignal::cancel("a")).unwrap();
    h.tick().await;
    assert!(h.scheduler.task(&id("a")).unwrap().cancel_requested);

    write_signal_file(&signals, &ExecutionSignal::started("a")).unwrap();
    let report = h.tick().await;
    assert_eq!(report.cancelled, vec![id("a")]);
    assert!(h.scheduler.is_finished());
}

#[tokio::test]
async fn test_cancel_rules() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler
        .submit(&[
            TaskSpec::new("a", &[]),
            TaskSpec::new("b", &[]),
            TaskSpec::new("later", &["a"]),
        ])
        .unwrap();
    h.tick().await;
    assert_eq!(
        h.scheduler.cancel(&id("later")).unwrap(),
        CancelOutcome::Cancelled
    );
    // Cancelling twice is harmless
    assert_eq!(
        h.scheduler.cancel(&id("later")).unwrap(),
        CancelOutcome::Cancelled
    );

    h.complete("a", "README.md", "# a\n");
    h.complete("b", "README.md", "# b\n");
    h.tick().await;
    // a merged; b conflicted and waits in completed
    assert_eq!(h.scheduler.status(&id("b")), Some(TaskStatus::Completed));
    for task in ["a", "b"] {
        assert!(matches!(
            h.scheduler.cancel(&id(task)).unwrap_err(),
            Error::InvalidTransition { .. }
        ));
    }
    assert!(matches!(
        h.scheduler.cancel(&id("nope")).unwrap_err(),
        Error::NotFound(_)
    ));
}
