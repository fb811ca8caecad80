//! Core domain models: task identity, status lifecycle, and the
//! dependency graph that orders execution.

pub mod graph;
pub mod task;

pub use graph::DependencyGraph;
pub use task::{Task, TaskId, TaskSpec, TaskStatus, WorkerId};
