//! gpusched-core: Core types and traits for the gpusched job scheduler
//!
//! This crate provides the fundamental types used throughout the system:
//! - Job records and the status state machine
//! - GPU device model and monitoring (NVML or synthetic fallback)
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod job;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use job::*;
