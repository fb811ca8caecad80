//! Parallel execution: the concurrency bound and workspace isolation.

use std::collections::HashSet;
use std::fs;

use grove::core::TaskStatus;
use grove::orchestration::SchedulerEvent;

use crate::fixtures::{id, independent, SchedulerHarness};

/// Given more independent tasks than workspace slots
/// When the workflow runs to completion one completion at a time
/// Then the number of live workspaces never exceeds the bound
#[tokio::test]
async fn test_concurrency_bound_never_exceeded() {
    const MAX: usize = 3;
    let mut h = SchedulerHarness::new(MAX);
    h.scheduler.submit(&independent(8)).unwrap();

    let mut peak = 0;
    let mut rounds = 0;
    while !h.scheduler.is_finished() {
        rounds += 1;
        assert!(rounds < 50, "workflow did not converge");

        let report = h.tick().await;
        let live = h.scheduler.workspaces().live_count();
        peak = peak.max(live);
        assert!(live <= MAX, "{} live workspaces exceed bound {}", live, MAX);
        if !report.assigned.is_empty() {
            assert!(report.assigned.len() <= MAX);
        }

        // Finish the oldest running task only
        let running = h
            .scheduler
            .tasks()
            .into_iter()
            .find(|t| t.status == TaskStatus::Assigned)
            .map(|t| t.id.clone());
        if let Some(task) = running {
            h.complete_default(task.as_str());
        }
    }
    assert_eq!(peak, MAX);
    for i in 0..8 {
        assert!(h.repo.target_file(&format!("task-{}.txt", i)).is_some());
    }
}

/// Given a full set of slots
/// When one running task completes
/// Then exactly one deferred task takes its slot, in declaration order
#[tokio::test]
async fn test_deferred_tasks_fill_freed_slots_in_order() {
    let mut h = SchedulerHarness::new(2);
    h.scheduler.submit(&independent(4)).unwrap();

    let report = h.tick().await;
    assert_eq!(report.assigned, vec![id("task-0"), id("task-1")]);
    assert_eq!(report.deferred, vec![id("task-2"), id("task-3")]);

    h.complete_default("task-1");
    let report = h.tick().await;
    assert_eq!(report.merged, vec![id("task-1")]);
    assert_eq!(report.assigned, vec![id("task-2")]);
    assert_eq!(report.deferred, vec![id("task-3")]);
}

/// Given two concurrently running tasks
/// When each writes into its workspace
/// Then neither sees the other's files until they are merged
#[tokio::test]
async fn test_workspaces_are_isolated() {
    let mut h = SchedulerHarness::new(4);
    h.scheduler.submit(&independent(2)).unwrap();
    h.tick().await;

    let first = h.workspace_of("task-0");
    let second = h.workspace_of("task-1");
    assert_ne!(first, second);

    fs::write(first.join("private.txt"), "zero\n").unwrap();
    assert!(!second.join("private.txt").exists());
    assert!(!h.repo.path.join("private.txt").exists());

    let branches: HashSet<String> = h
        .scheduler
        .registry()
        .list(&grove::registry::ListFilter::all())
        .into_iter()
        .filter_map(|e| e.workspace.map(|ws| ws.branch))
        .collect();
    assert_eq!(branches.len(), 2);
}

/// Every assignment carries a distinct worker and a distinct path.
#[tokio::test]
async fn test_assignments_are_unique() {
    let mut h = SchedulerHarness::new(5);
    h.scheduler.submit(&independent(5)).unwrap();
    h.tick().await;

    let mut workers = HashSet::new();
    let mut paths = HashSet::new();
    for event in h.drain_events() {
        if let SchedulerEvent::TaskAssigned { worker, path, .. } = event {
            assert!(workers.insert(worker));
            assert!(paths.insert(path));
        }
    }
    assert_eq!(workers.len(), 5);

    for i in 0..5 {
        let entry = h.scheduler.registry().query(&id(&format!("task-{}", i))).unwrap();
        let owner = entry.owner.unwrap();
        assert_eq!(h.scheduler.registry().query_by_owner(owner).len(), 1);
    }
}
