//! Run reporting: failed tasks, per-task records and the run summary

use chrono::{DateTime, Utc};
use nbeval_core::format_duration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::task::{Task, TaskState};

/// A task that did not finish successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTask {
    /// Task id (insertion order)
    pub id: usize,
    /// Task description
    pub description: String,
    /// One-line error summary
    pub error: String,
    /// Stack trace or error chain
    pub trace: String,
}

/// Post-run record of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: usize,
    pub description: String,
    pub cpus: u32,
    pub gpus: u32,
    /// Slots the task ran on, e.g. `CPU [0] GPU [1]`
    pub slots: String,
    /// Device indices visible to the task
    pub gpu_devices: Vec<u32>,
    pub state: TaskState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub runtime: Option<Duration>,
}

impl TaskRecord {
    pub fn from_task(task: &Task) -> Self {
        let placement = task.placement().cloned().unwrap_or_default();
        Self {
            id: task.id(),
            description: task.description().to_string(),
            cpus: task.cpus(),
            gpus: task.gpus(),
            slots: placement.slots,
            gpu_devices: placement.gpu_devices,
            state: task.state(),
            start_time: task.start_time(),
            end_time: task.end_time(),
            runtime: task.runtime(),
        }
    }

    /// Summary line, e.g. `Task 3 on CPU [0] finished in 4.2s: Evaluating index.md`
    pub fn summary_line(&self) -> String {
        let runtime = self
            .runtime
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        let slots = if self.slots.is_empty() {
            "no slots"
        } else {
            &self.slots
        };
        format!(
            "Task {} on {} {} in {}: {}",
            self.id,
            slots,
            self.state.to_string().to_lowercase(),
            runtime,
            self.description
        )
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Every task, sorted ascending by runtime
    pub tasks: Vec<TaskRecord>,
    /// Tasks that failed
    pub failed: Vec<FailedTask>,
    /// Largest number of CPU slots in use at once
    pub peak_cpus: u32,
    /// Largest number of GPU slots in use at once
    pub peak_gpus: u32,
    /// Wall time of the run
    pub elapsed: Duration,
    /// Whether the run stopped at its time budget
    pub timed_out: bool,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Records sorted ascending by runtime; tasks that never ran come first
pub fn sorted_records<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Vec<TaskRecord> {
    let mut records: Vec<TaskRecord> = tasks.into_iter().map(TaskRecord::from_task).collect();
    records.sort_by_key(|r| r.runtime);
    records
}

/// Aggregated message naming every failed task, or an empty string
pub fn error_message(failed: &[FailedTask]) -> String {
    if failed.is_empty() {
        return String::new();
    }

    let mut message = format!(
        "{} task{} failed:\n",
        failed.len(),
        if failed.len() == 1 { "" } else { "s" }
    );
    for task in failed {
        message.push_str(&format!(
            "Task {} ({}) exited with error: {}\n{}\n",
            task.id,
            task.description,
            task.error,
            task.trace.trim_end()
        ));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(id: usize, description: &str) -> FailedTask {
        FailedTask {
            id,
            description: description.to_string(),
            error: "boom".to_string(),
            trace: "at foo.rs:1".to_string(),
        }
    }

    #[test]
    fn test_error_message_empty() {
        assert_eq!(error_message(&[]), "");
    }

    #[test]
    fn test_error_message_names_every_task() {
        let message = error_message(&[failed(0, "Evaluating a.md"), failed(3, "Evaluating b.md")]);
        assert!(message.starts_with("2 tasks failed:"));
        assert!(message.contains("Task 0 (Evaluating a.md) exited with error: boom"));
        assert!(message.contains("Task 3 (Evaluating b.md)"));
        assert!(message.contains("at foo.rs:1"));
    }

    #[test]
    fn test_summary_line() {
        let record = TaskRecord {
            id: 2,
            description: "Evaluating index.md".to_string(),
            cpus: 1,
            gpus: 1,
            slots: "CPU [0] GPU [1]".to_string(),
            gpu_devices: vec![1],
            state: TaskState::Succeeded,
            start_time: None,
            end_time: None,
            runtime: Some(Duration::from_millis(4200)),
        };
        assert_eq!(
            record.summary_line(),
            "Task 2 on CPU [0] GPU [1] succeeded in 4.2s: Evaluating index.md"
        );
    }
}
