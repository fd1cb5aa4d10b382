//! gpusched-api: REST API server for gpusched
//!
//! This crate provides the HTTP boundary of the scheduler:
//! - Job submission
//! - Queue listing and job detail
//! - GPU metrics
//! - Log retrieval and streaming

pub mod rest;

pub use rest::{create_router, AppState};
