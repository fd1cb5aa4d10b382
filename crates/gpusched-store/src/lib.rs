//! gpusched-store: Durable job store
//!
//! This crate provides the single source of truth for job state:
//! - One JSON record per job, replaced atomically on every transition
//! - Compare-and-transition semantics guarding the status state machine
//! - Ownership of submitted scripts and captured job logs

pub mod jobs;
pub mod layout;
pub mod logs;

pub use jobs::{queue_order, JobStore};
pub use layout::StoreLayout;
pub use logs::LogChunk;
