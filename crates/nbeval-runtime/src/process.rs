//! Process-based executor
//!
//! Each work item runs in a forked child process. The child restricts its GPU
//! visibility, runs the work under `catch_unwind` and writes a JSON report to
//! a pipe before leaving through `_exit`, so an error, panic or abort inside
//! the work never reaches the scheduler's process.

use nbeval_core::{NbevalError, NbevalResult, TaskFailure, Work};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::traits::{ExecutionHandle, ExecutionStatus, Executor};

/// Process executor configuration
#[derive(Debug, Clone)]
pub struct ProcessExecutorConfig {
    /// Environment variable listing the devices visible to a task
    pub visible_devices_env: String,
    /// Value used when a task is assigned no GPU; must not name a real device
    pub no_device_placeholder: String,
}

impl Default for ProcessExecutorConfig {
    fn default() -> Self {
        Self {
            visible_devices_env: "CUDA_VISIBLE_DEVICES".to_string(),
            no_device_placeholder: "-1".to_string(),
        }
    }
}

/// Executor running every work item in its own forked process
///
/// `fork` copies only the calling thread, so start tasks from a
/// single-threaded process. A lock held by another thread at fork time
/// (allocator, environment) stays locked forever in the child, which then
/// hangs. The first start from a multi-threaded process logs a warning.
pub struct ProcessExecutor {
    config: ProcessExecutorConfig,
    warned_threads: AtomicBool,
}

impl ProcessExecutor {
    /// Create a new process executor
    pub fn new(config: ProcessExecutorConfig) -> Self {
        Self {
            config,
            warned_threads: AtomicBool::new(false),
        }
    }

    fn warn_if_multithreaded(&self) {
        let Some(threads) = thread_count() else {
            return;
        };
        if threads > 1 && !self.warned_threads.swap(true, Ordering::Relaxed) {
            warn!(
                threads = threads,
                "Forking task processes from a multi-threaded process, a task may hang at start"
            );
        }
    }

    /// Value of the device visibility variable for the given GPUs
    pub fn visible_devices(&self, gpu_ids: &[u32]) -> String {
        if gpu_ids.is_empty() {
            return self.config.no_device_placeholder.clone();
        }
        gpu_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(ProcessExecutorConfig::default())
    }
}

impl Executor for ProcessExecutor {
    fn start(&self, gpu_ids: &[u32], work: Work) -> NbevalResult<Box<dyn ExecutionHandle>> {
        self.warn_if_multithreaded();
        let devices = self.visible_devices(gpu_ids);
        let label = work.label().to_string();
        let (reader, writer) = report_pipe()
            .map_err(|e| NbevalError::Runtime(format!("Failed to create report pipe: {}", e)))?;

        // SAFETY: the child only sets its own environment, runs the work and
        // leaves through `_exit` without returning into the caller.
        match unsafe { libc::fork() } {
            -1 => Err(NbevalError::Runtime(format!(
                "Failed to fork task process: {}",
                io::Error::last_os_error()
            ))),
            0 => {
                drop(reader);
                run_child(writer, &self.config.visible_devices_env, &devices, work)
            }
            pid => {
                drop(writer);
                debug!(
                    pid = pid,
                    devices = %devices,
                    work = %label,
                    "Task process forked"
                );
                Ok(Box::new(ProcessHandle::new(pid, reader)))
            }
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Number of threads of this process, where the OS reports it
fn thread_count() -> Option<usize> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_thread_count(&status)
}

fn parse_thread_count(status: &str) -> Option<usize> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|n| n.trim().parse().ok())
}

/// Report sent by the child over the pipe
#[derive(Debug, Serialize, Deserialize)]
enum ChildReport {
    Succeeded,
    Failed(TaskFailure),
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn run_child(mut writer: File, env_key: &str, devices: &str, work: Work) -> ! {
    std::env::set_var(env_key, devices);

    let report = run_caught(work);
    let code = match report {
        ChildReport::Succeeded => 0,
        ChildReport::Failed(_) => 1,
    };
    if let Ok(bytes) = serde_json::to_vec(&report) {
        let _ = writer.write_all(&bytes);
    }
    drop(writer);

    // SAFETY: `_exit` ends the child without running destructors or atexit
    // handlers that belong to the parent's state.
    unsafe { libc::_exit(code) }
}

fn run_caught(work: Work) -> ChildReport {
    // The hook only records the trace; the parent decides what gets logged.
    panic::set_hook(Box::new(|info| {
        let trace = format!("{}\n\nstack backtrace:\n{}", info, Backtrace::force_capture());
        PANIC_TRACE.with(|t| *t.borrow_mut() = Some(trace));
    }));

    match panic::catch_unwind(AssertUnwindSafe(move || work.run())) {
        Ok(Ok(())) => ChildReport::Succeeded,
        Ok(Err(e)) => ChildReport::Failed(TaskFailure::from_error(&e)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let trace = PANIC_TRACE
                .with(|t| t.borrow_mut().take())
                .unwrap_or_else(|| message.clone());
            ChildReport::Failed(TaskFailure::new(format!("panicked: {}", message), trace))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Pipe whose read end never blocks; neither end survives an `exec`
fn report_pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` has room for the two descriptors written by `pipe`.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and have no other owner.
    let (reader, writer) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };

    set_fd_flag(&reader, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    set_fd_flag(&writer, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    set_fd_flag(&reader, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;
    Ok((reader, writer))
}

fn set_fd_flag(
    file: &File,
    get: libc::c_int,
    set: libc::c_int,
    flag: libc::c_int,
) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid descriptor owned by `file`.
    let flags = unsafe { libc::fcntl(fd, get) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, set, flags | flag) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Handle to a forked task process
///
/// Dropping the handle does not kill the process.
pub struct ProcessHandle {
    pid: libc::pid_t,
    reader: File,
    report: Vec<u8>,
    reaped: bool,
}

impl ProcessHandle {
    fn new(pid: libc::pid_t, reader: File) -> Self {
        Self {
            pid,
            reader,
            report: Vec::new(),
            reaped: false,
        }
    }

    /// Read whatever the child has written so far
    ///
    /// Draining on every poll keeps a large report from filling the pipe
    /// and blocking the child before it can exit.
    fn drain(&mut self) -> io::Result<()> {
        let mut buf = [0u8; 8192];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => self.report.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn try_wait(&self) -> io::Result<Option<libc::c_int>> {
        let mut status: libc::c_int = 0;
        loop {
            // SAFETY: `WNOHANG` makes this a non-blocking check of our own child.
            let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
            match rc {
                0 => return Ok(None),
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                _ => return Ok(Some(status)),
            }
        }
    }

    fn outcome(&self, status: libc::c_int) -> ExecutionStatus {
        match serde_json::from_slice::<ChildReport>(&self.report) {
            Ok(ChildReport::Succeeded) => ExecutionStatus::Succeeded,
            Ok(ChildReport::Failed(failure)) => ExecutionStatus::Failed(failure),
            Err(_) => ExecutionStatus::Failed(TaskFailure::new(
                describe_exit(status),
                "no trace captured: the task process ended before reporting its outcome",
            )),
        }
    }
}

impl ExecutionHandle for ProcessHandle {
    fn poll(&mut self) -> NbevalResult<ExecutionStatus> {
        if self.reaped {
            return Err(NbevalError::Runtime(format!(
                "Task process {} was already reaped",
                self.pid
            )));
        }

        self.drain()
            .map_err(|e| NbevalError::Runtime(format!("Failed to read task report: {}", e)))?;

        let status = match self.try_wait().map_err(|e| {
            NbevalError::Runtime(format!("Failed to check task process {}: {}", self.pid, e))
        })? {
            Some(status) => status,
            None => return Ok(ExecutionStatus::Running),
        };
        self.reaped = true;

        self.drain()
            .map_err(|e| NbevalError::Runtime(format!("Failed to read task report: {}", e)))?;
        Ok(self.outcome(status))
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid as u32)
    }
}

fn describe_exit(status: libc::c_int) -> String {
    if libc::WIFSIGNALED(status) {
        format!(
            "task process was killed by signal {}",
            libc::WTERMSIG(status)
        )
    } else if libc::WIFEXITED(status) {
        format!(
            "task process exited with code {} without reporting",
            libc::WEXITSTATUS(status)
        )
    } else {
        format!("task process ended with wait status {}", status)
    }
}
