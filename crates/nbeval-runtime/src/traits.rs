//! Executor trait definitions

use nbeval_core::{NbevalResult, TaskFailure, Work};

/// Outcome of polling a running task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// The task is still running
    Running,
    /// The work returned successfully
    Succeeded,
    /// The work returned an error, panicked or its process died
    Failed(TaskFailure),
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// Executor trait for starting work items in isolation
pub trait Executor: Send + Sync {
    /// Start `work` with only the GPU devices in `gpu_ids` visible to it
    fn start(&self, gpu_ids: &[u32], work: Work) -> NbevalResult<Box<dyn ExecutionHandle>>;

    /// Get the executor name
    fn name(&self) -> &'static str;
}

/// Handle to a started work item
pub trait ExecutionHandle: Send {
    /// Check for completion without blocking
    ///
    /// Returns a finished status exactly once; polling again afterwards is an
    /// error.
    fn poll(&mut self) -> NbevalResult<ExecutionStatus>;

    /// OS process id, if the executor uses one
    fn pid(&self) -> Option<u32>;
}
