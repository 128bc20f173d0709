//! Work items and failure reports
//!
//! A work item is opaque to the scheduler: a label for logging and a closure
//! that is called exactly once, synchronously, inside the task process.

use crate::{NbevalError, NbevalResult};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

type WorkFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// A unit of work: a labelled closure run once inside an isolated process
pub struct Work {
    label: String,
    run: WorkFn,
}

impl Work {
    /// Wrap a closure as a work item
    pub fn new<F>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(f),
        }
    }

    /// Run an external command; a non-zero exit status is an error
    ///
    /// The command inherits the task process environment, including its
    /// restricted GPU visibility.
    pub fn command(argv: Vec<String>, workdir: Option<PathBuf>) -> NbevalResult<Self> {
        let Some((program, args)) = argv.split_first() else {
            return Err(NbevalError::Config("Command must not be empty".to_string()));
        };
        let program = program.clone();
        let args = args.to_vec();
        let label = argv.join(" ");

        Ok(Self::new(label.clone(), move || {
            let mut cmd = Command::new(&program);
            cmd.args(&args).stdin(Stdio::null());
            if let Some(dir) = &workdir {
                cmd.current_dir(dir);
            }

            let output = cmd
                .output()
                .with_context(|| format!("failed to run `{label}`"))?;
            if !output.status.success() {
                bail!(
                    "`{}` exited with {}\n{}",
                    label,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim_end()
                );
            }
            Ok(())
        }))
    }

    /// Human-readable label of the work
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Consume the work item and run it
    pub fn run(self) -> anyhow::Result<()> {
        (self.run)()
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work").field("label", &self.label).finish()
    }
}

/// Error and stack trace captured from a failed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// One-line error summary
    pub error: String,
    /// Formatted stack trace or error chain
    pub trace: String,
}

impl TaskFailure {
    pub fn new(error: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            trace: trace.into(),
        }
    }

    /// Capture an error returned by a work item
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            error: format!("{:#}", err),
            trace: format!("{:?}", err),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_work_runs_closure() {
        let work = Work::new("ok", || Ok(()));
        assert_eq!(work.label(), "ok");
        assert!(work.run().is_ok());
    }

    #[test]
    fn test_empty_command_rejected() {
        let result = Work::command(Vec::new(), None);
        assert!(matches!(result, Err(NbevalError::Config(_))));
    }

    #[test]
    fn test_command_label() {
        let work = Work::command(vec!["echo".to_string(), "hello".to_string()], None).unwrap();
        assert_eq!(work.label(), "echo hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_exit_status() {
        let ok = Work::command(vec!["true".to_string()], None).unwrap();
        assert!(ok.run().is_ok());

        let failing = Work::command(
            vec!["sh".to_string(), "-c".to_string(), "echo boom >&2; exit 3".to_string()],
            None,
        )
        .unwrap();
        let err = failing.run().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_failure_from_error_chain() {
        let err = anyhow!("kernel died").context("Evaluating chapter_intro.md");
        let failure = TaskFailure::from_error(&err);
        assert_eq!(failure.error, "Evaluating chapter_intro.md: kernel died");
        assert!(failure.trace.contains("Caused by"));
    }
}
