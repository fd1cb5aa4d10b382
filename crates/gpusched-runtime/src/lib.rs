//! gpusched-runtime: Job execution layer
//!
//! This crate launches dispatched jobs and records their outcome:
//! - Process-based runtime bound to the assigned device
//! - Combined stdout/stderr capture into the job log
//! - Terminal transitions written back to the job store

pub mod process;
pub mod traits;

pub use process::{ProcessRunner, ProcessRunnerConfig};
pub use traits::{LaunchHandle, Runtime};
