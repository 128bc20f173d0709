//! nbeval CLI
//!
//! Command-line interface running notebook evaluation jobs in parallel under
//! CPU/GPU slot limits.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// nbeval - resource-constrained parallel notebook evaluation
#[derive(Parser, Debug)]
#[command(name = "nbeval")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show detected GPUs
    Gpus,

    /// Estimate the GPU need of source files
    Estimate {
        /// Markdown or source files to inspect
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// GPU need reported for multi-GPU sources
        #[arg(long, default_value_t = 2)]
        max_gpus: u32,
    },

    /// Run every task of a job file
    Run {
        /// Job file (TOML)
        job: PathBuf,

        /// Number of CPU slots (defaults to the job file setting)
        #[arg(long)]
        cpu_workers: Option<u32>,

        /// Number of GPU slots (defaults to the job file setting)
        #[arg(long)]
        gpu_workers: Option<u32>,

        /// Write the run summary as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

// Tasks are forked from the scheduler thread, so keep the process single-threaded
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        cli.log_level.parse::<Level>()?
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        Commands::Gpus => {
            commands::gpus()?;
        }
        Commands::Estimate { files, max_gpus } => {
            commands::estimate(&files, max_gpus)?;
        }
        Commands::Run {
            job,
            cpu_workers,
            gpu_workers,
            report,
        } => {
            commands::run(&job, cpu_workers, gpu_workers, report).await?;
        }
    }

    Ok(())
}
