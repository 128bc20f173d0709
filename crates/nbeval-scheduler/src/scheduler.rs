//! Main scheduler logic
//!
//! A single controlling loop starts pending tasks whose demand fits into free
//! slots, polls running tasks without blocking, and releases their slots when
//! they finish. Tasks run in their own processes; a failing task is recorded
//! and never stops its siblings.

use nbeval_core::{
    detect_gpus, format_duration, CommandProbe, GpuProbe, NbevalError, NbevalResult,
    SchedulerConfig, TaskFailure, Work,
};
use nbeval_runtime::{ExecutionStatus, Executor, ProcessExecutor, ProcessExecutorConfig};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::lock::{InterProcessLock, LockNamespace};
use crate::report::{self, FailedTask, RunSummary};
use crate::slot_pool::{SlotKind, SlotPool};
use crate::task::{Placement, Task, TaskState};

/// Retry interval while another scheduler is starting a process
const START_LOCK_RETRY: Duration = Duration::from_millis(50);

/// Scheduler running tasks in parallel under CPU/GPU slot limits
pub struct Scheduler {
    /// Scheduler configuration
    config: SchedulerConfig,
    /// CPU and GPU slots
    pool: SlotPool,
    /// Serializes process creation across schedulers on this host
    start_lock: InterProcessLock,
    /// Executor starting each task in isolation
    executor: Arc<dyn Executor>,
    /// Tasks in scheduling order
    tasks: Vec<Task>,
    /// Tasks that did not finish successfully
    failed: Vec<FailedTask>,
    /// Whether `run` was called
    has_run: bool,
}

impl Scheduler {
    /// Create a scheduler sized from the GPUs reported by `nvidia-smi`
    pub fn new(config: SchedulerConfig) -> NbevalResult<Self> {
        Self::with_probe(config, &CommandProbe::nvidia_smi())
    }

    /// Create a scheduler sized from the GPUs reported by `probe`
    pub fn with_probe(config: SchedulerConfig, probe: &dyn GpuProbe) -> NbevalResult<Self> {
        config.validate()?;

        let gpu_info = detect_gpus(probe);
        let num_gpus = match config.gpu_workers {
            Some(requested) if requested > gpu_info.count() => {
                return Err(NbevalError::Config(format!(
                    "# of available GPUs {} is less than requested {}",
                    gpu_info.count(),
                    requested
                )));
            }
            Some(requested) => requested,
            None => gpu_info.count(),
        };
        let num_cpus = config.resolved_cpu_workers(num_gpus);

        let namespace = LockNamespace::from_config(&config);
        let gpu_devices = gpu_info
            .indices()
            .into_iter()
            .take(num_gpus as usize)
            .collect();
        let pool = SlotPool::new(num_cpus, gpu_devices, &namespace)?;
        let start_lock = InterProcessLock::open(namespace.start_path())?;

        let executor = Arc::new(ProcessExecutor::new(ProcessExecutorConfig {
            visible_devices_env: config.visible_devices_env.clone(),
            ..ProcessExecutorConfig::default()
        }));

        info!(
            cpu_workers = num_cpus,
            gpu_workers = num_gpus,
            detected_gpus = gpu_info.count(),
            user = namespace.user(),
            "Scheduler initialized"
        );

        Ok(Self {
            config,
            pool,
            start_lock,
            executor,
            tasks: Vec::new(),
            failed: Vec::new(),
            has_run: false,
        })
    }

    /// Replace the executor starting the tasks
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Get the number of CPU slots
    pub fn cpu_workers(&self) -> u32 {
        self.pool.cpu_count()
    }

    /// Get the number of GPU slots
    pub fn gpu_workers(&self) -> u32 {
        self.pool.gpu_count()
    }

    /// Queue a task needing `cpus` CPU slots and `gpus` GPU slots
    ///
    /// Returns the task id. A task that could never fit into the pool is
    /// rejected here rather than left to starve.
    pub fn add(
        &mut self,
        cpus: u32,
        gpus: u32,
        work: Work,
        description: impl Into<String>,
    ) -> NbevalResult<usize> {
        if self.has_run {
            return Err(NbevalError::Scheduler(
                "Cannot add tasks after the scheduler has run".to_string(),
            ));
        }
        if cpus == 0 && gpus == 0 {
            return Err(NbevalError::Config(
                "Need at least one CPU or GPU".to_string(),
            ));
        }
        if cpus > self.pool.cpu_count() || gpus > self.pool.gpu_count() {
            return Err(NbevalError::ResourceExhausted(format!(
                "Not enough resources to run the task: requested {} CPU / {} GPU, pool has {} CPU / {} GPU",
                cpus,
                gpus,
                self.pool.cpu_count(),
                self.pool.gpu_count()
            )));
        }

        let id = self.tasks.len();
        let task = Task::new(id, cpus, gpus, work, description.into());
        debug!(
            task_id = id,
            cpus = cpus,
            gpus = gpus,
            description = task.description(),
            "Task added"
        );
        self.tasks.push(task);
        Ok(id)
    }

    /// Tasks in scheduling order
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Tasks that did not finish successfully
    pub fn failed_tasks(&self) -> &[FailedTask] {
        &self.failed
    }

    /// Message naming every failed task, empty when nothing failed
    pub fn error_message(&self) -> String {
        report::error_message(&self.failed)
    }

    /// Run every queued task and wait until all are done
    ///
    /// Stops early once the configured time budget is spent; unfinished
    /// tasks are then recorded as failed. Running processes are not killed.
    ///
    /// With the default [`ProcessExecutor`] every task is forked from the
    /// calling process, so drive this from a single-threaded runtime
    /// (`#[tokio::main(flavor = "current_thread")]`): a child forked while
    /// another thread holds the allocator or environment lock can deadlock.
    pub async fn run(&mut self) -> NbevalResult<RunSummary> {
        if self.has_run {
            return Err(NbevalError::Scheduler(
                "The scheduler can only run once".to_string(),
            ));
        }
        self.has_run = true;

        // GPU-heavy and large tasks first; the sort is stable
        self.tasks
            .sort_by(|a, b| (b.gpus(), b.cpus()).cmp(&(a.gpus(), a.cpus())));

        info!(
            tasks = self.tasks.len(),
            cpu_workers = self.pool.cpu_count(),
            gpu_workers = self.pool.gpu_count(),
            "Running tasks"
        );

        let started = Instant::now();
        let deadline = started.checked_add(self.config.max_runtime());
        let mut last_status = started;
        let mut peak_cpus = 0;
        let mut peak_gpus = 0;
        let mut timed_out = false;

        loop {
            if self.tasks.iter().all(Task::is_done) {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                timed_out = true;
                self.expire_unfinished();
                break;
            }
            if last_status.elapsed() >= self.config.status_interval() {
                self.log_status();
                last_status = Instant::now();
            }

            self.start_next().await;

            let (cpus, gpus) = self.usage();
            debug_assert!(cpus <= self.pool.cpu_count() && gpus <= self.pool.gpu_count());
            peak_cpus = peak_cpus.max(cpus);
            peak_gpus = peak_gpus.max(gpus);

            self.reap();

            tokio::time::sleep(self.config.poll_interval()).await;
        }

        let summary = RunSummary {
            tasks: report::sorted_records(&self.tasks),
            failed: self.failed.clone(),
            peak_cpus,
            peak_gpus,
            elapsed: started.elapsed(),
            timed_out,
        };
        self.log_summary(&summary);
        Ok(summary)
    }

    /// Start the first pending task whose demand fits into free slots
    async fn start_next(&mut self) {
        let mut chosen = None;
        for (index, task) in self.tasks.iter().enumerate() {
            if task.state() != TaskState::Pending {
                continue;
            }
            if let Some(slots) = self.pool.try_acquire(task.cpus(), task.gpus()) {
                chosen = Some((index, slots));
                break;
            }
        }
        let Some((index, slots)) = chosen else {
            return;
        };

        let gpu_devices = self.pool.gpu_devices(&slots);
        let placement = Placement {
            slots: self.pool.describe(&slots),
            gpu_devices: gpu_devices.clone(),
        };

        let Some(work) = self.tasks[index].take_work() else {
            self.pool.release(&slots);
            self.fail_task(
                index,
                TaskFailure::new("work was already consumed", "the task cannot be started twice"),
            );
            return;
        };

        self.acquire_start_lock().await;
        let start_time = Utc::now();
        let started_at = Instant::now();

        let launched = match self.executor.start(&gpu_devices, work) {
            Ok(handle) => {
                let task = &mut self.tasks[index];
                info!(
                    task_id = task.id(),
                    pid = ?handle.pid(),
                    "Starting task {} on {} {}",
                    task.id(),
                    placement.slots,
                    task.description()
                );
                task.mark_running(slots, placement, handle, start_time, started_at);
                true
            }
            Err(e) => {
                self.pool.release(&slots);
                self.fail_task(
                    index,
                    TaskFailure::new(e.to_string(), "the task process could not be started"),
                );
                false
            }
        };

        // No other process start on this host until the delay has passed
        let start_delay = self.config.start_delay();
        if launched && !start_delay.is_zero() {
            tokio::time::sleep(start_delay).await;
        }
        self.start_lock.release();
    }

    async fn acquire_start_lock(&mut self) {
        while !self.start_lock.try_acquire() {
            tokio::time::sleep(START_LOCK_RETRY).await;
        }
    }

    /// Poll running tasks and release the slots of finished ones
    fn reap(&mut self) {
        for index in 0..self.tasks.len() {
            let task = &mut self.tasks[index];
            if task.state() != TaskState::Running {
                continue;
            }
            let Some(handle) = task.handle_mut() else {
                continue;
            };

            let failure = match handle.poll() {
                Ok(ExecutionStatus::Running) => continue,
                Ok(ExecutionStatus::Succeeded) => None,
                Ok(ExecutionStatus::Failed(failure)) => Some(failure),
                Err(e) => Some(TaskFailure::new(
                    e.to_string(),
                    "the scheduler lost track of the task process",
                )),
            };

            match failure {
                None => {
                    let released = task.mark_done(true);
                    self.pool.release(&released);
                    info!(
                        task_id = task.id(),
                        "Task {} is finished in {}",
                        task.id(),
                        task.runtime().map(format_duration).unwrap_or_default()
                    );
                }
                Some(failure) => self.fail_task(index, failure),
            }
        }
    }

    /// Record a task as failed and release whatever it holds
    fn fail_task(&mut self, index: usize, failure: TaskFailure) {
        let released = self.record_failure(index, failure);
        self.pool.release(&released);
    }

    /// Record a task as failed; returns the slots it held
    fn record_failure(&mut self, index: usize, failure: TaskFailure) -> Vec<usize> {
        let task = &mut self.tasks[index];
        let held = task.mark_done(false);

        error!(
            task_id = task.id(),
            "Task {} exited with error: {}\n{}",
            task.id(),
            failure.error,
            failure.trace
        );
        self.failed.push(FailedTask {
            id: task.id(),
            description: task.description().to_string(),
            error: failure.error,
            trace: failure.trace,
        });
        held
    }

    /// Fail every task still pending or running once the time budget is spent
    ///
    /// Slots of a task still running stay claimed: its process keeps using
    /// them, and the inherited lock descriptors keep them locked for other
    /// schedulers until that process exits.
    fn expire_unfinished(&mut self) {
        let budget = format_duration(self.config.max_runtime());
        warn!(budget = %budget, "Time budget exhausted, no further tasks will be started");

        for index in 0..self.tasks.len() {
            let task = &self.tasks[index];
            match task.state() {
                TaskState::Running => {
                    let pid = task.pid().map(|p| p.to_string()).unwrap_or_default();
                    let held = self.record_failure(
                        index,
                        TaskFailure::new(
                            format!("still running after the {} time budget", budget),
                            format!("process {} was left running", pid),
                        ),
                    );
                    warn!(
                        task_id = self.tasks[index].id(),
                        pid = %pid,
                        "Slots {} stay locked until the task process exits",
                        self.pool.describe(&held)
                    );
                }
                TaskState::Pending => self.fail_task(
                    index,
                    TaskFailure::new(
                        format!("not started within the {} time budget", budget),
                        "the task never acquired its slots",
                    ),
                ),
                TaskState::Succeeded | TaskState::Failed => {}
            }
        }
    }

    /// CPU and GPU slots held by running tasks
    fn usage(&self) -> (u32, u32) {
        self.tasks
            .iter()
            .filter(|t| t.state() == TaskState::Running)
            .fold((0, 0), |(cpus, gpus), t| (cpus + t.cpus(), gpus + t.gpus()))
    }

    fn log_status(&self) {
        let running: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.state() == TaskState::Running)
            .collect();
        let done = self.tasks.iter().filter(|t| t.is_done()).count();
        let not_started = self.tasks.len() - running.len() - done;

        let free_cpus = self.pool.available_count(SlotKind::Cpu);
        let free_gpus = self.pool.available_count(SlotKind::Gpu);

        info!(
            running = running.len(),
            done = done,
            not_started = not_started,
            free_cpus = free_cpus,
            free_gpus = free_gpus,
            "Status: {} running, {} done, {} not started, {} CPU / {} GPU slots free",
            running.len(),
            done,
            not_started,
            free_cpus,
            free_gpus
        );
        for task in running {
            let slots = task.placement().map(|p| p.slots.as_str()).unwrap_or("");
            info!(
                task_id = task.id(),
                "  Task {} on {} is running for {}: {}",
                task.id(),
                slots,
                task.elapsed().map(format_duration).unwrap_or_default(),
                task.description()
            );
        }
    }

    fn log_summary(&self, summary: &RunSummary) {
        info!(
            tasks = summary.tasks.len(),
            failed = summary.failed.len(),
            timed_out = summary.timed_out,
            "Finished {} tasks in {}, sorted by runtime:",
            summary.tasks.len(),
            format_duration(summary.elapsed)
        );
        for record in &summary.tasks {
            info!("  {}", record.summary_line());
        }
    }
}
