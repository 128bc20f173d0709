//! Scheduled task and its state

use chrono::{DateTime, Utc};
use nbeval_core::Work;
use nbeval_runtime::ExecutionHandle;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for slots
    Pending,
    /// Running in its own process
    Running,
    /// Finished without error
    Succeeded,
    /// Finished with an error, or never able to run
    Failed,
}

impl TaskState {
    pub fn is_done(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "Pending"),
            TaskState::Running => write!(f, "Running"),
            TaskState::Succeeded => write!(f, "Succeeded"),
            TaskState::Failed => write!(f, "Failed"),
        }
    }
}

/// Where a task was placed, kept for reporting after its slots are released
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Slots rendered as `CPU [0] GPU [1]`
    pub slots: String,
    /// Device indices visible to the task
    pub gpu_devices: Vec<u32>,
}

/// One unit of work with its declared demand and scheduling state
///
/// While running, the task owns its slots and process handle; once done it
/// owns neither.
pub struct Task {
    id: usize,
    cpus: u32,
    gpus: u32,
    description: String,
    work: Option<Work>,
    state: TaskState,
    slots: Vec<usize>,
    placement: Option<Placement>,
    handle: Option<Box<dyn ExecutionHandle>>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
    runtime: Option<Duration>,
}

impl Task {
    /// Create a pending task; an empty description is derived from the work
    pub fn new(id: usize, cpus: u32, gpus: u32, work: Work, description: String) -> Self {
        let description = if description.is_empty() {
            format!("for target {}", work.label())
        } else {
            description
        };

        Self {
            id,
            cpus,
            gpus,
            description,
            work: Some(work),
            state: TaskState::Pending,
            slots: Vec::new(),
            placement: None,
            handle: None,
            start_time: None,
            end_time: None,
            started_at: None,
            runtime: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    pub fn gpus(&self) -> u32 {
        self.gpus
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Slots held while running
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    /// Placement chosen when the task started
    pub fn placement(&self) -> Option<&Placement> {
        self.placement.as_ref()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// Wall time between start and completion
    pub fn runtime(&self) -> Option<Duration> {
        self.runtime
    }

    /// Time since the task started, while it runs
    pub fn elapsed(&self) -> Option<Duration> {
        match self.state {
            TaskState::Running => self.started_at.map(|t| t.elapsed()),
            _ => None,
        }
    }

    pub(crate) fn take_work(&mut self) -> Option<Work> {
        self.work.take()
    }

    pub(crate) fn handle_mut(&mut self) -> Option<&mut Box<dyn ExecutionHandle>> {
        self.handle.as_mut()
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid())
    }

    /// Pending -> Running, stamped with the time the process was started
    pub(crate) fn mark_running(
        &mut self,
        slots: Vec<usize>,
        placement: Placement,
        handle: Box<dyn ExecutionHandle>,
        start_time: DateTime<Utc>,
        started_at: Instant,
    ) {
        debug_assert_eq!(self.state, TaskState::Pending);
        self.slots = slots;
        self.placement = Some(placement);
        self.handle = Some(handle);
        self.start_time = Some(start_time);
        self.started_at = Some(started_at);
        self.state = TaskState::Running;
    }

    /// Move to a final state; returns the slots the caller must release
    pub(crate) fn mark_done(&mut self, succeeded: bool) -> Vec<usize> {
        debug_assert!(!self.is_done(), "task {} completed twice", self.id);
        self.handle = None;
        self.work = None;
        self.end_time = Some(Utc::now());
        self.runtime = self.started_at.map(|t| t.elapsed());
        self.state = if succeeded {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        std::mem::take(&mut self.slots)
    }

    #[cfg(test)]
    pub(crate) fn invariants_hold(&self) -> bool {
        let handle_implies_running = self.handle.is_none() || !self.is_done();
        let done_implies_released =
            !self.is_done() || (self.handle.is_none() && self.slots.is_empty());
        handle_implies_running && done_implies_released
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("cpus", &self.cpus)
            .field("gpus", &self.gpus)
            .field("description", &self.description)
            .field("state", &self.state)
            .field("slots", &self.slots)
            .finish()
    }
}
