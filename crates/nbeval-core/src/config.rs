//! Configuration types for nbeval

use crate::{NbevalError, NbevalResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Scheduler configuration
///
/// Owned by the build driver and passed to the scheduler; nothing here is
/// process-global.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of CPU worker slots (defaults to the GPU count, or 2 without GPUs)
    pub cpu_workers: Option<u32>,
    /// Number of GPU worker slots (defaults to every detected GPU)
    pub gpu_workers: Option<u32>,
    /// Directory holding the inter-process lock files
    pub lock_dir: PathBuf,
    /// Prefix of the lock file names
    pub lock_prefix: String,
    /// User namespace of the lock files (defaults to the current OS user)
    pub user: Option<String>,
    /// Sleep between two scheduling iterations, in milliseconds
    pub poll_interval_ms: u64,
    /// Interval between two status lines, in seconds
    pub status_interval_secs: u64,
    /// How long the global start lock is held after starting a task, in milliseconds
    pub start_delay_ms: u64,
    /// Wall-clock budget of a whole run, in seconds
    pub max_runtime_secs: u64,
    /// Environment variable restricting the devices a task can see
    pub visible_devices_env: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu_workers: None,
            gpu_workers: None,
            lock_dir: std::env::temp_dir(),
            lock_prefix: "nbeval".to_string(),
            user: None,
            poll_interval_ms: 1000,
            status_interval_secs: 60,
            start_delay_ms: 1000,
            max_runtime_secs: 24 * 60 * 60,
            visible_devices_env: "CUDA_VISIBLE_DEVICES".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> NbevalResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NbevalError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| NbevalError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Reject settings that would make the run loop spin or never start
    pub fn validate(&self) -> NbevalResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(NbevalError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_runtime_secs == 0 {
            return Err(NbevalError::Config(
                "max_runtime_secs must be greater than zero".to_string(),
            ));
        }
        if self.lock_prefix.is_empty() {
            return Err(NbevalError::Config("lock_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    /// Number of CPU slots given the number of GPU slots
    pub fn resolved_cpu_workers(&self, gpu_count: u32) -> u32 {
        self.cpu_workers
            .unwrap_or(if gpu_count > 0 { gpu_count } else { 2 })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }
}

/// Job file format (TOML): scheduler settings plus the tasks to run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFile {
    /// Scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Tasks to schedule
    #[serde(default, rename = "task")]
    pub tasks: Vec<JobTask>,
}

impl JobFile {
    /// Load a job file
    pub fn from_file(path: &Path) -> NbevalResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NbevalError::Config(format!("Failed to read job file: {}", e)))?;
        Self::parse(&content)
    }

    /// Parse a job file from TOML text
    pub fn parse(content: &str) -> NbevalResult<Self> {
        let job: JobFile = toml::from_str(content)?;
        for (i, task) in job.tasks.iter().enumerate() {
            if task.command.is_empty() {
                return Err(NbevalError::Config(format!("task {} has an empty command", i)));
            }
        }
        Ok(job)
    }
}

/// One task of a job file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTask {
    /// Command line to run
    pub command: Vec<String>,
    /// Working directory, relative to the job file
    pub workdir: Option<PathBuf>,
    /// Description used in log lines
    pub description: Option<String>,
    /// Number of CPU slots
    #[serde(default = "default_task_cpus")]
    pub cpus: u32,
    /// Declared number of GPU slots; estimated from `source` when absent
    pub gpus: Option<u32>,
    /// Source file inspected to estimate the GPU need
    pub source: Option<PathBuf>,
    /// Upper bound of the estimated GPU need
    #[serde(default = "default_task_max_gpus")]
    pub max_gpus: u32,
}

fn default_task_cpus() -> u32 {
    1
}

fn default_task_max_gpus() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_scheduler_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.max_runtime(), Duration::from_secs(86400));
        assert_eq!(config.visible_devices_env, "CUDA_VISIBLE_DEVICES");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolved_cpu_workers() {
        let config = SchedulerConfig::default();
        assert_eq!(config.resolved_cpu_workers(0), 2);
        assert_eq!(config.resolved_cpu_workers(4), 4);

        let config = SchedulerConfig {
            cpu_workers: Some(8),
            ..SchedulerConfig::default()
        };
        assert_eq!(config.resolved_cpu_workers(4), 8);
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let config = SchedulerConfig {
            poll_interval_ms: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(config.validate(), Err(NbevalError::Config(_))));
    }

    #[test]
    fn test_job_file_parse() {
        let toml_str = r#"
[scheduler]
cpu_workers = 4
gpu_workers = 1
poll_interval_ms = 200

[[task]]
description = "Evaluating chapter_preliminaries/ndarray.md"
command = ["jupyter", "nbconvert", "--execute", "ndarray.ipynb"]
source = "chapter_preliminaries/ndarray.md"

[[task]]
command = ["python", "train.py"]
cpus = 2
gpus = 1
"#;
        let job = JobFile::parse(toml_str).unwrap();
        assert_eq!(job.scheduler.cpu_workers, Some(4));
        assert_eq!(job.scheduler.poll_interval_ms, 200);
        assert_eq!(job.scheduler.start_delay_ms, 1000);
        assert_eq!(job.tasks.len(), 2);
        assert_eq!(job.tasks[0].cpus, 1);
        assert_eq!(job.tasks[0].gpus, None);
        assert_eq!(job.tasks[0].max_gpus, 2);
        assert_eq!(job.tasks[1].gpus, Some(1));
    }

    #[test]
    fn test_job_file_rejects_empty_command() {
        let result = JobFile::parse("[[task]]\ncommand = []\n");
        assert!(matches!(result, Err(NbevalError::Config(_))));
    }

    #[test]
    fn test_scheduler_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nbeval.toml");
        std::fs::write(&path, "gpu_workers = 0\nlock_prefix = \"book\"\n").unwrap();

        let config = SchedulerConfig::from_file(&path).unwrap();
        assert_eq!(config.gpu_workers, Some(0));
        assert_eq!(config.lock_prefix, "book");
    }
}
