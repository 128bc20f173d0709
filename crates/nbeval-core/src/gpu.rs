//! GPU detection
//!
//! The only question the scheduler asks about the machine is "which GPUs
//! exist". Probing never fails: a missing or failing device-query tool simply
//! means there are no GPUs to schedule.

use serde::{Deserialize, Serialize};
use std::process::{Command, Stdio};
use tracing::debug;

/// Represents a GPU device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuDevice {
    /// Device index as seen by the driver
    pub index: u32,
    /// Device name
    pub name: String,
}

/// GPU information for the system
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GpuInfo {
    /// List of detected GPU devices
    pub devices: Vec<GpuDevice>,
}

impl GpuInfo {
    /// Create empty GPU info (no GPUs detected)
    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Build device entries from names, indexed in probe order
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| GpuDevice {
                index: i as u32,
                name: name.into(),
            })
            .collect();
        Self { devices }
    }

    /// Get the total number of GPUs
    pub fn count(&self) -> u32 {
        self.devices.len() as u32
    }

    /// Get device indices
    pub fn indices(&self) -> Vec<u32> {
        self.devices.iter().map(|d| d.index).collect()
    }
}

/// Source of the list of GPU device names on this host
pub trait GpuProbe: Send + Sync {
    /// Return the names of the available GPUs, or an empty list
    fn list_gpus(&self) -> Vec<String>;
}

/// Probe that shells out to a device-query command
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    /// Create a probe running `program` with `args`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Probe NVIDIA devices with `nvidia-smi`
    pub fn nvidia_smi() -> Self {
        Self::new(
            "nvidia-smi",
            vec![
                "--query-gpu=name".to_string(),
                "--format=csv,noheader".to_string(),
            ],
        )
    }
}

impl Default for CommandProbe {
    fn default() -> Self {
        Self::nvidia_smi()
    }
}

impl GpuProbe for CommandProbe {
    fn list_gpus(&self) -> Vec<String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Ok(o) => {
                debug!(
                    program = %self.program,
                    status = %o.status,
                    "GPU query exited unsuccessfully, assuming no GPUs"
                );
                Vec::new()
            }
            Err(e) => {
                debug!(
                    program = %self.program,
                    error = %e,
                    "GPU query unavailable, assuming no GPUs"
                );
                Vec::new()
            }
        }
    }
}

/// Probe returning a fixed device list
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    names: Vec<String>,
}

impl StaticProbe {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl GpuProbe for StaticProbe {
    fn list_gpus(&self) -> Vec<String> {
        self.names.clone()
    }
}

/// Detect GPUs using the given probe
pub fn detect_gpus(probe: &dyn GpuProbe) -> GpuInfo {
    GpuInfo::from_names(probe.list_gpus())
}
