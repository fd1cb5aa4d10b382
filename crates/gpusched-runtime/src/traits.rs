//! Runtime trait definitions

use async_trait::async_trait;
use gpusched_core::{GpuschedResult, Job};
use std::path::PathBuf;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Handle to a launched job
#[derive(Debug)]
pub struct LaunchHandle {
    pub job_id: Uuid,
    /// OS process id, when the runtime runs processes
    pub pid: Option<u32>,
    /// Resolves to the job in its terminal state
    pub completion: JoinHandle<GpuschedResult<Job>>,
}

/// Runtime trait for executing jobs
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Check that a queued job can be started and create its empty log.
    ///
    /// Returns the log path. Called before the job is claimed, so it must not
    /// change job state.
    async fn prepare(&self, job: &Job) -> GpuschedResult<PathBuf>;

    /// Start a job that was moved to RUNNING.
    ///
    /// Returns as soon as the job is started; the runtime records the
    /// terminal transition when it ends, including when it cannot be started.
    async fn launch(&self, job: &Job) -> GpuschedResult<LaunchHandle>;

    /// Get the runtime name
    fn name(&self) -> &'static str;
}
