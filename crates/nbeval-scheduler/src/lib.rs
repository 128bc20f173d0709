//! nbeval-scheduler: Resource-constrained parallel task scheduler
//!
//! This crate runs queued tasks concurrently under CPU/GPU slot limits:
//! - Slot accounting guarded by inter-process file locks
//! - GPU need estimation from task sources
//! - The polling scheduler loop, failure collection and reporting

pub mod classifier;
pub mod lock;
pub mod report;
pub mod scheduler;
pub mod slot_pool;
pub mod task;

pub use classifier::{estimate_gpu_need, PatternClassifier, ResourceEstimator, ResourceNeed};
pub use lock::{InterProcessLock, LockNamespace};
pub use report::{FailedTask, RunSummary, TaskRecord};
pub use scheduler::Scheduler;
pub use slot_pool::{SlotKind, SlotPool};
pub use task::{Placement, Task, TaskState};
