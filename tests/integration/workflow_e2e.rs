//! End-to-end workflow tests: submission through merge.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use grove::core::{TaskSpec, TaskStatus};
use grove::orchestration::SchedulerEvent;
use grove::Error;

use crate::fixtures::{diamond, id, SchedulerHarness};

/// Given a diamond task list
/// When every worker succeeds
/// Then tasks merge level by level and the target holds all their work
#[tokio::test]
async fn test_diamond_runs_to_completion() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler.submit(&diamond()).unwrap();

    let report = h.tick().await;
    assert_eq!(report.assigned, vec![id("base")]);

    h.complete_default("base");
    let report = h.tick().await;
    assert_eq!(report.merged, vec![id("base")]);
    assert_eq!(report.assigned, vec![id("left"), id("right")]);
    assert_eq!(h.scheduler.status(&id("top")), Some(TaskStatus::Pending));

    h.complete_default("left");
    let report = h.tick().await;
    assert_eq!(report.merged, vec![id("left")]);
    // right is still outstanding, so top waits
    assert!(report.assigned.is_empty());

    h.complete_default("right");
    let report = h.tick().await;
    assert_eq!(report.merged, vec![id("right")]);
    assert_eq!(report.assigned, vec![id("top")]);

    let top = h.workspace_of("top");
    for file in ["base.txt", "left.txt", "right.txt"] {
        assert!(top.join(file).exists(), "{} missing from top's workspace", file);
    }

    h.complete_default("top");
    h.tick().await;
    assert!(h.scheduler.is_finished());
    for task in ["base", "left", "right", "top"] {
        assert_eq!(h.scheduler.status(&id(task)), Some(TaskStatus::Merged));
        assert_eq!(
            h.repo.target_file(&format!("{}.txt", task)),
            Some(format!("{}\n", task))
        );
    }
    assert_eq!(h.scheduler.workspaces().live_count(), 0);
}

/// Given a running workflow
/// When a task is assigned, started, completed and merged
/// Then lifecycle events arrive in that order
#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let mut h = SchedulerHarness::new(2);
    h.scheduler.submit(&[TaskSpec::new("solo", &[])]).unwrap();
    h.tick().await;
    h.scheduler.signal_sender().started(&id("solo")).unwrap();
    h.tick().await;
    h.complete_default("solo");
    h.tick().await;

    let kinds: Vec<&'static str> = h
        .drain_events()
        .iter()
        .map(|event| match event {
            SchedulerEvent::TaskReady { .. } => "ready",
            SchedulerEvent::TaskAssigned { .. } => "assigned",
            SchedulerEvent::TaskStarted { .. } => "started",
            SchedulerEvent::TaskCompleted { .. } => "completed",
            SchedulerEvent::TaskMerged { .. } => "merged",
            SchedulerEvent::MergeConflict { .. } => "conflict",
            SchedulerEvent::TaskFailed { .. } => "failed",
            SchedulerEvent::TaskCancelled { .. } => "cancelled",
            SchedulerEvent::AllTasksFinished => "finished",
        })
        .collect();
    assert_eq!(kinds, vec!["ready", "assigned", "started", "completed", "merged"]);
}

/// Given a chain a -> b -> c and an unrelated d
/// When a fails
/// Then b and c fail without ever getting a workspace and d is unaffected
#[tokio::test]
async fn test_failure_propagates_down_the_chain() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler
        .submit(&[
            TaskSpec::new("a", &[]),
            TaskSpec::new("b", &["a"]),
            TaskSpec::new("c", &["b"]),
            TaskSpec::new("d", &[]),
        ])
        .unwrap();
    h.tick().await;

    h.fail("a", "compilation failed");
    h.complete_default("d");
    let report = h.tick().await;
    assert_eq!(report.failed, vec![id("a"), id("b"), id("c")]);
    assert_eq!(report.merged, vec![id("d")]);
    assert!(h.scheduler.is_finished());

    for task in ["b", "c"] {
        let history = h.scheduler.registry().history(&id(task));
        assert_eq!(history.len(), 1, "{} should have exactly one entry", task);
        assert!(history[0].workspace.is_none());
        assert!(history[0].owner.is_none());
    }

    let report = h.scheduler.failure_report(&id("a")).unwrap();
    assert_eq!(report.reason.as_deref(), Some("compilation failed"));
    assert_eq!(
        report.affected,
        vec![(id("b"), TaskStatus::Failed), (id("c"), TaskStatus::Failed)]
    );
    let c = h.scheduler.failure_report(&id("c")).unwrap();
    assert_eq!(c.propagated_from, Some(id("b")));
}

/// Given a task list containing a cycle
/// When it is submitted
/// Then it is rejected and nothing is allocated or recorded
#[tokio::test]
async fn test_cycle_rejected_with_zero_allocations() {
    let mut h = SchedulerHarness::new(4);
    let err = h
        .scheduler
        .submit(&[
            TaskSpec::new("ok", &[]),
            TaskSpec::new("x", &["z"]),
            TaskSpec::new("y", &["x"]),
            TaskSpec::new("z", &["y"]),
        ])
        .unwrap_err();
    match err {
        Error::Cycle { cycle } => {
            for member in ["x", "y", "z"] {
                assert!(cycle.contains(&id(member)), "cycle {:?} misses {}", cycle, member);
            }
        }
        other => panic!("expected cycle error, got {:?}", other),
    }

    let report = h.tick().await;
    assert!(report.assigned.is_empty());
    assert!(h.scheduler.registry().is_empty());
    assert!(h.scheduler.workspaces().list().is_empty());
    assert!(h.repo.git_ops().list_worktrees().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_dependency_and_duplicate_id_rejected() {
    let mut h = SchedulerHarness::new(4);
    assert!(h
        .scheduler
        .submit(&[TaskSpec::new("a", &["ghost"])])
        .is_err());
    assert!(h
        .scheduler
        .submit(&[TaskSpec::new("a", &[]), TaskSpec::new("a", &[])])
        .is_err());
    assert!(h.scheduler.tasks().is_empty());

    // A valid list is still accepted afterwards
    h.scheduler.submit(&[TaskSpec::new("a", &[])]).unwrap();
    assert_eq!(h.scheduler.tasks().len(), 1);
}

/// Given simulated workers that react to assignment events
/// When the scheduler runs unattended
/// Then it finishes on its own and reports completion
#[tokio::test]
async fn test_run_with_simulated_workers() {
    let h = SchedulerHarness::new(2);
    let SchedulerHarness {
        mut scheduler,
        mut event_rx,
        repo,
    } = h;
    scheduler.submit(&crate::fixtures::diamond()).unwrap();

    let signals = scheduler.signal_sender();
    let worker = tokio::spawn(async move {
        let mut finished = false;
        while let Some(event) = event_rx.recv().await {
            match event {
                SchedulerEvent::TaskAssigned { task_id, path, .. } => {
                    signals.started(&task_id).unwrap();
                    std::fs::write(path.join(format!("{}.txt", task_id)), "done\n").unwrap();
                    signals.success(&task_id, "done").unwrap();
                }
                SchedulerEvent::AllTasksFinished => {
                    finished = true;
                    break;
                }
                _ => {}
            }
        }
        finished
    });

    tokio::time::timeout(
        Duration::from_secs(30),
        scheduler.run(Duration::from_millis(10), CancellationToken::new()),
    )
    .await
    .expect("scheduler did not finish in time")
    .unwrap();

    assert!(scheduler.is_finished());
    assert!(worker.await.unwrap());
    assert_eq!(repo.target_file("top.txt"), Some("done\n".to_string()));
}
