//! CLI commands implementation

use anyhow::{Context, Result};
use nbeval_core::{detect_gpus, format_duration, CommandProbe, JobFile, JobTask, Work};
use nbeval_scheduler::{PatternClassifier, ResourceEstimator, Scheduler};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Show GPU information
pub fn gpus() -> Result<()> {
    let gpu_info = detect_gpus(&CommandProbe::nvidia_smi());

    if gpu_info.count() == 0 {
        println!("No GPUs detected");
        return Ok(());
    }

    println!("GPUs: {}", gpu_info.count());
    println!();
    for device in &gpu_info.devices {
        println!("[{}] {}", device.index, device.name);
    }

    Ok(())
}

/// Print the estimated GPU need of each file
pub fn estimate(files: &[PathBuf], max_gpus: u32) -> Result<()> {
    for file in files {
        let source = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let need = classifier_for(file, max_gpus).estimate(&source);
        println!("{}\t{} GPU", file.display(), need.gpus);
    }

    Ok(())
}

/// Run every task of a job file and wait for all of them
pub async fn run(
    job_path: &Path,
    cpu_workers: Option<u32>,
    gpu_workers: Option<u32>,
    report: Option<PathBuf>,
) -> Result<()> {
    let job = JobFile::from_file(job_path)
        .with_context(|| format!("Failed to load job file {}", job_path.display()))?;
    let base = job_path.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut config = job.scheduler.clone();
    if cpu_workers.is_some() {
        config.cpu_workers = cpu_workers;
    }
    if gpu_workers.is_some() {
        config.gpu_workers = gpu_workers;
    }

    let mut scheduler = Scheduler::new(config)?;
    for task in &job.tasks {
        let gpus = gpu_demand(task, &base, scheduler.gpu_workers())?;
        let workdir = task.workdir.as_ref().map(|w| base.join(w));
        let work = Work::command(task.command.clone(), workdir)?;
        let description = task.description.clone().unwrap_or_default();
        scheduler.add(task.cpus, gpus, work, description)?;
    }

    let summary = scheduler.run().await?;

    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!(path = %path.display(), "Run report written");
    }

    if !summary.succeeded() {
        anyhow::bail!("{}", scheduler.error_message());
    }

    println!(
        "{} tasks finished in {}",
        summary.tasks.len(),
        format_duration(summary.elapsed)
    );
    Ok(())
}

/// GPU slots a job task asks for: declared, estimated from its source, or none
fn gpu_demand(task: &JobTask, base: &Path, pool_gpus: u32) -> Result<u32> {
    if let Some(gpus) = task.gpus {
        return Ok(gpus);
    }
    let Some(source) = &task.source else {
        return Ok(0);
    };

    let path = base.join(source);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let need = classifier_for(&path, task.max_gpus.min(pool_gpus)).estimate(&text);
    debug!(source = %path.display(), gpus = need.gpus, "Estimated GPU need");
    Ok(need.gpus)
}

/// Markdown notebooks are classified by their code blocks only
fn classifier_for(path: &Path, max_gpus: u32) -> PatternClassifier {
    let classifier = PatternClassifier::new(max_gpus);
    match path.extension().and_then(|e| e.to_str()) {
        Some("md") => classifier.code_blocks_only(),
        _ => classifier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_task(gpus: Option<u32>, source: Option<&str>) -> JobTask {
        JobTask {
            command: vec!["true".to_string()],
            workdir: None,
            description: None,
            cpus: 1,
            gpus,
            source: source.map(PathBuf::from),
            max_gpus: 2,
        }
    }

    #[test]
    fn test_declared_gpus_win() {
        let task = job_task(Some(1), Some("missing.md"));
        assert_eq!(gpu_demand(&task, Path::new("/nonexistent"), 4).unwrap(), 1);
    }

    #[test]
    fn test_no_source_needs_no_gpu() {
        let task = job_task(None, None);
        assert_eq!(gpu_demand(&task, Path::new("."), 2).unwrap(), 0);
    }

    #[test]
    fn test_estimate_capped_at_pool() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("multi.md"),
            "# Multiple GPUs\n\n```python\ndevices = d2l.try_all_gpus()\n```\n",
        )
        .unwrap();

        let task = job_task(None, Some("multi.md"));
        assert_eq!(gpu_demand(&task, dir.path(), 2).unwrap(), 2);
        assert_eq!(gpu_demand(&task, dir.path(), 1).unwrap(), 1);
        assert_eq!(gpu_demand(&task, dir.path(), 0).unwrap(), 0);
    }

    #[test]
    fn test_markdown_prose_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("prose.md"),
            "Call `try_all_gpus` on a multi-GPU machine.\n\n```python\nx = 1\n```\n",
        )
        .unwrap();

        let task = job_task(None, Some("prose.md"));
        assert_eq!(gpu_demand(&task, dir.path(), 2).unwrap(), 0);
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let task = job_task(None, Some("missing.md"));
        assert!(gpu_demand(&task, dir.path(), 2).is_err());
    }
}
