//! Orchestration layer: the scheduler control loop, worker signals, and
//! reconciliation of finished workspaces into the target branch.

mod reconciler;
mod scheduler;
pub mod signal;

pub use reconciler::{MergeOutcome, MergeResults, Reconciler};
pub use scheduler::{CancelOutcome, FailureReport, Scheduler, SchedulerEvent, TickReport};
pub use signal::{ExecutionSignal, SignalKind, SignalSender};
