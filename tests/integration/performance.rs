//! Performance tests for graph resolution and registry bookkeeping.
//!
//! Thresholds are generous so the tests catch accidental quadratic
//! behavior rather than machine speed.
//! Use `cargo test --test integration performance -- --nocapture` to see metrics.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use grove::core::{DependencyGraph, TaskId, TaskSpec, TaskStatus};
use grove::registry::{CoordinationRegistry, EntryUpdate, RegistryEntry};

/// Performance thresholds
const TASK_COUNT: usize = 2000;
const MAX_GRAPH_BUILD_MS: u128 = 500;
const MAX_READY_SCAN_MS: u128 = 200;
const MAX_REGISTRY_OPS_MS: u128 = 1000;

fn chain(count: usize) -> Vec<TaskSpec> {
    let ids: Vec<String> = (0..count).map(|i| format!("step-{}", i)).collect();
    (0..count)
        .map(|i| {
            if i == 0 {
                TaskSpec::new(&ids[i], &[])
            } else {
                TaskSpec::new(&ids[i], &[ids[i - 1].as_str()])
            }
        })
        .collect()
}

/// One root feeding every other task, all of which feed one sink.
fn fan(count: usize) -> Vec<TaskSpec> {
    let mut specs = vec![TaskSpec::new("root", &[])];
    let middle: Vec<String> = (0..count).map(|i| format!("leaf-{}", i)).collect();
    for id in &middle {
        specs.push(TaskSpec::new(id, &["root"]));
    }
    let refs: Vec<&str> = middle.iter().map(String::as_str).collect();
    specs.push(TaskSpec::new("sink", &refs));
    specs
}

fn merged_entry(id: &str) -> RegistryEntry {
    RegistryEntry::unassigned(TaskId::from(id), id, Vec::new(), TaskStatus::Merged)
}

#[test]
fn test_graph_build_long_chain() {
    let specs = chain(TASK_COUNT);
    let start = Instant::now();
    let graph = DependencyGraph::build(&specs).unwrap();
    let elapsed = start.elapsed().as_millis();
    println!("chain of {} built in {}ms", TASK_COUNT, elapsed);

    assert_eq!(graph.len(), TASK_COUNT);
    assert_eq!(graph.dependency_count(), TASK_COUNT - 1);
    assert!(
        elapsed < MAX_GRAPH_BUILD_MS,
        "chain build took {}ms (max {}ms)",
        elapsed,
        MAX_GRAPH_BUILD_MS
    );
}

#[test]
fn test_graph_build_wide_fan() {
    let specs = fan(TASK_COUNT);
    let start = Instant::now();
    let graph = DependencyGraph::build(&specs).unwrap();
    let elapsed = start.elapsed().as_millis();
    println!("fan of {} built in {}ms", TASK_COUNT, elapsed);

    assert_eq!(graph.dependency_count(), 2 * TASK_COUNT);
    assert_eq!(graph.dependencies(&TaskId::from("sink")).len(), TASK_COUNT);
    assert!(elapsed < MAX_GRAPH_BUILD_MS);
}

#[test]
fn test_cycle_detection_on_large_input() {
    let mut specs = chain(TASK_COUNT);
    let last = format!("step-{}", TASK_COUNT - 1);
    specs[0] = TaskSpec::new("step-0", &[last.as_str()]);

    let start = Instant::now();
    let result = DependencyGraph::build(&specs);
    let elapsed = start.elapsed().as_millis();
    println!("cycle of {} detected in {}ms", TASK_COUNT, elapsed);

    assert!(result.is_err());
    assert!(elapsed < MAX_GRAPH_BUILD_MS);
}

#[test]
fn test_ready_scan_on_wide_fan() {
    let graph = DependencyGraph::build(&fan(TASK_COUNT)).unwrap();
    let registry = CoordinationRegistry::in_memory();
    registry.register(merged_entry("root")).unwrap();

    let start = Instant::now();
    let ready = graph.ready_tasks(&registry);
    let elapsed = start.elapsed().as_millis();
    println!("ready scan over {} tasks in {}ms", graph.len(), elapsed);

    assert_eq!(ready.len(), TASK_COUNT);
    assert_eq!(ready[0], TaskId::from("leaf-0"));
    assert!(!ready.contains(&TaskId::from("sink")));
    assert!(
        elapsed < MAX_READY_SCAN_MS,
        "ready scan took {}ms (max {}ms)",
        elapsed,
        MAX_READY_SCAN_MS
    );
}

#[test]
fn test_incremental_unblocking_along_chain() {
    let mut graph = DependencyGraph::build(&chain(TASK_COUNT)).unwrap();
    let start = Instant::now();
    for i in 0..TASK_COUNT - 1 {
        let unblocked = graph.on_task_merged(&TaskId::from(format!("step-{}", i).as_str()));
        assert_eq!(unblocked, vec![TaskId::from(format!("step-{}", i + 1).as_str())]);
    }
    let elapsed = start.elapsed().as_millis();
    println!("{} merges propagated in {}ms", TASK_COUNT - 1, elapsed);
    assert!(elapsed < MAX_READY_SCAN_MS);
}

#[test]
fn test_registry_concurrent_updates() {
    const THREADS: usize = 8;
    let registry = Arc::new(CoordinationRegistry::in_memory());
    let per_thread = TASK_COUNT / THREADS;

    let start = Instant::now();
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let id = format!("t{}-{}", t, i);
                    registry
                        .register(RegistryEntry::unassigned(
                            TaskId::from(id.as_str()),
                            &id,
                            Vec::new(),
                            TaskStatus::Cancelled,
                        ))
                        .unwrap();
                    registry
                        .update(
                            &TaskId::from(id.as_str()),
                            EntryUpdate::default().with_summary("checked"),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let elapsed = start.elapsed().as_millis();
    println!(
        "{} registrations and updates across {} threads in {}ms",
        THREADS * per_thread,
        THREADS,
        elapsed
    );

    assert_eq!(registry.len(), THREADS * per_thread);
    assert!(registry
        .query(&TaskId::from("t3-7"))
        .unwrap()
        .summary
        .is_some_and(|s| s == "checked"));
    assert!(
        elapsed < MAX_REGISTRY_OPS_MS,
        "registry operations took {}ms (max {}ms)",
        elapsed,
        MAX_REGISTRY_OPS_MS
    );
}
