//! nbeval-core: Core types for the nbeval scheduler
//!
//! This crate provides the fundamental types used throughout nbeval:
//! - Work items and task failure reports
//! - Scheduler and job file configuration
//! - Error handling
//! - GPU detection

pub mod config;
pub mod error;
pub mod gpu;
pub mod time;
pub mod work;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use time::*;
pub use work::*;
