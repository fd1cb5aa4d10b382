//! Process-based runtime implementation
//!
//! Each job runs as a direct child process that only sees its assigned
//! device. Stdout and stderr share one append handle on the job log, so the
//! output keeps its order and the runner never sits between the job and its
//! pipes. The failure report carries the last lines of that log.
//! One supervisor task per job owns the child handle and is the only writer
//! of the job's terminal transition.

use async_trait::async_trait;
use chrono::Utc;
use gpusched_core::{ExitInfo, GpuschedError, GpuschedResult, Job, RuntimeConfig, Transition};
use gpusched_store::JobStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::traits::{LaunchHandle, Runtime};

/// Bytes read back from the end of the log for the failure report
const TAIL_WINDOW_BYTES: u64 = 64 * 1024;

/// Process-based runtime configuration
#[derive(Debug, Clone)]
pub struct ProcessRunnerConfig {
    /// Interpreter for scripts; scripts are executed directly when unset
    pub interpreter: Option<PathBuf>,
    /// Number of trailing log lines kept for the failure report
    pub stderr_tail_lines: usize,
}

impl Default for ProcessRunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            stderr_tail_lines: 20,
        }
    }
}

impl From<&RuntimeConfig> for ProcessRunnerConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            stderr_tail_lines: config.stderr_tail_lines,
        }
    }
}

/// Process-based runtime for executing jobs
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
    store: Arc<JobStore>,
    /// Live child process ids indexed by job
    active: Arc<RwLock<HashMap<Uuid, Option<u32>>>>,
}

impl ProcessRunner {
    /// Create a new process runner
    pub fn new(config: ProcessRunnerConfig, store: Arc<JobStore>) -> Self {
        Self {
            config,
            store,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Jobs whose process has not exited yet
    pub async fn active_jobs(&self) -> Vec<Uuid> {
        self.active.read().await.keys().copied().collect()
    }

    /// Build the command to start a job
    fn build_command(&self, job: &Job, gpu_id: u32, stdout: Stdio, stderr: Stdio) -> Command {
        let mut cmd = match &self.config.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&job.script_path);
                cmd
            }
            None => Command::new(&job.script_path),
        };

        // Restrict the CUDA runtime of the job to its assigned device
        cmd.env("CUDA_DEVICE_ORDER", "PCI_BUS_ID");
        cmd.env("CUDA_VISIBLE_DEVICES", gpu_id.to_string());
        cmd.env("GPUSCHED_JOB_ID", job.id.to_string());

        cmd.stdin(Stdio::null());
        cmd.stdout(stdout);
        cmd.stderr(stderr);
        cmd.kill_on_drop(true);

        cmd
    }

    async fn check_runnable(&self, job: &Job) -> GpuschedResult<()> {
        let metadata = tokio::fs::metadata(&job.script_path).await.map_err(|e| {
            GpuschedError::Runtime(format!(
                "script artifact {} is not accessible: {}",
                job.script_path.display(),
                e
            ))
        })?;
        if !metadata.is_file() {
            return Err(GpuschedError::Runtime(format!(
                "script artifact {} is not a regular file",
                job.script_path.display()
            )));
        }

        match &self.config.interpreter {
            Some(interpreter) => {
                if resolve_program(interpreter).await.is_none() {
                    return Err(GpuschedError::Runtime(format!(
                        "interpreter {} not found",
                        interpreter.display()
                    )));
                }
            }
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if metadata.permissions().mode() & 0o111 == 0 {
                        return Err(GpuschedError::Runtime(format!(
                            "script artifact {} is not executable",
                            job.script_path.display()
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    async fn fail_launch(&self, job: &Job, log_path: &Path, reason: String) -> GpuschedError {
        error!(job_id = %job.id, error = %reason, "Failed to spawn job process");

        if let Err(e) = append_line(log_path, &reason).await {
            warn!(job_id = %job.id, error = %e, "Failed to write launch failure to log");
        }
        let transition = Transition::fail(ExitInfo::failure(reason.clone()), Utc::now());
        if let Err(e) = self.store.transition(job.id, transition).await {
            error!(job_id = %job.id, error = %e, "Failed to record launch failure");
        }

        GpuschedError::Runtime(reason)
    }
}

#[async_trait]
impl Runtime for ProcessRunner {
    async fn prepare(&self, job: &Job) -> GpuschedResult<PathBuf> {
        self.check_runnable(job).await?;

        let log_path = self.store.layout().log_path(job.id);
        // Never truncate: a concurrent claimant may already be writing
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        Ok(log_path)
    }

    async fn launch(&self, job: &Job) -> GpuschedResult<LaunchHandle> {
        let gpu_id = job.assigned_gpu_id.ok_or_else(|| {
            GpuschedError::Runtime(format!("job {} has no assigned device", job.id))
        })?;
        let log_path = job
            .log_path
            .clone()
            .unwrap_or_else(|| self.store.layout().log_path(job.id));

        info!(
            job_id = %job.id,
            gpu_id = gpu_id,
            script = %job.script_path.display(),
            "Starting job process"
        );

        let (stdout, stderr) = match open_output(&log_path).await {
            Ok(output) => output,
            Err(e) => {
                let reason = format!("failed to open log {}: {}", log_path.display(), e);
                return Err(self.fail_launch(job, &log_path, reason).await);
            }
        };

        let mut child = match self.build_command(job, gpu_id, stdout, stderr).spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("failed to start process: {}", e);
                return Err(self.fail_launch(job, &log_path, reason).await);
            }
        };

        let pid = child.id();
        self.active.write().await.insert(job.id, pid);
        debug!(job_id = %job.id, pid = ?pid, "Job process spawned");

        let job_id = job.id;
        let store = self.store.clone();
        let active = self.active.clone();
        let tail_lines = self.config.stderr_tail_lines;

        let completion = tokio::spawn(async move {
            let status = child.wait().await;

            let exit_info = match status {
                Ok(status) if status.success() => ExitInfo::exited(status.code(), None),
                Ok(status) => {
                    let tail = match read_tail(&log_path, tail_lines).await {
                        Ok(lines) => (!lines.is_empty()).then(|| lines.join("\n")),
                        Err(e) => {
                            warn!(job_id = %job_id, error = %e, "Failed to read log tail");
                            None
                        }
                    };
                    ExitInfo::exited(status.code(), tail)
                }
                Err(e) => ExitInfo::failure(format!("failed to wait for process: {}", e)),
            };

            active.write().await.remove(&job_id);

            let result = store
                .transition(job_id, Transition::finish(exit_info, Utc::now()))
                .await;
            match &result {
                Ok(job) => info!(
                    job_id = %job_id,
                    status = %job.status,
                    exit_code = ?job.exit_info.as_ref().and_then(|e| e.exit_code),
                    "Job finished"
                ),
                Err(e) => error!(job_id = %job_id, error = %e, "Failed to record job outcome"),
            }
            result
        });

        Ok(LaunchHandle {
            job_id,
            pid,
            completion,
        })
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// One append handle on the log for both output streams
async fn open_output(log_path: &Path) -> std::io::Result<(Stdio, Stdio)> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?
        .into_std()
        .await;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

/// Last `keep` lines of a log, decoded lossily
async fn read_tail(log_path: &Path, keep: usize) -> std::io::Result<Vec<String>> {
    if keep == 0 {
        return Ok(Vec::new());
    }

    let mut file = tokio::fs::File::open(log_path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(TAIL_WINDOW_BYTES);
    file.seek(SeekFrom::Start(start)).await?;
    let mut data = Vec::new();
    file.read_to_end(&mut data).await?;

    let text = String::from_utf8_lossy(&data);
    let mut lines: Vec<&str> = text.lines().collect();
    // The window may open in the middle of a line
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(keep);
    Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await
}

/// Locate a program the way the OS would when spawning it
async fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return is_file(program).await.then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(program);
        if is_file(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
