//! Integration test suite for grove.
//!
//! These tests drive the scheduler against real git repositories in
//! temporary directories. Workers are simulated by writing files into
//! the assigned workspace and sending signals.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Task lists from submission to merge
//! - `parallel_workspaces`: Concurrency bound and workspace isolation
//! - `conflict_resolution`: Merge ordering and conflict handling
//! - `recovery`: Restart, requeue, deadlines and cancellation
//! - `performance`: Graph and registry throughput thresholds

mod fixtures;

mod conflict_resolution;
mod parallel_workspaces;
mod performance;
mod recovery;
mod workflow_e2e;
