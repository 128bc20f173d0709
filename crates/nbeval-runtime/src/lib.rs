//! nbeval-runtime: Isolated execution of work items
//!
//! This crate runs each work item in its own OS process:
//! - GPU visibility restricted to the devices assigned to the task
//! - Errors and panics reported back to the parent with a trace
//! - Non-blocking polling of the running process

#[cfg(unix)]
pub mod process;
pub mod traits;

#[cfg(unix)]
pub use process::{ProcessExecutor, ProcessExecutorConfig};
pub use traits::{ExecutionHandle, ExecutionStatus, Executor};
