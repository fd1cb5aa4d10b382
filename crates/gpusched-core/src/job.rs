//! Job, submission request and status transition definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{GpuschedError, GpuschedResult};

/// A submitted unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier, never reused
    pub id: Uuid,
    /// Submitter
    pub user_id: String,
    /// Stored copy of the submitted script
    pub script_path: PathBuf,
    /// Requested device memory in bytes
    pub vram_required: u64,
    /// Partition tag
    pub partition: String,
    /// Quality-of-service class
    pub qos: String,
    /// Current status
    pub status: JobStatus,
    /// Priority score, refreshed on every dispatcher tick while queued
    pub priority_score: f64,
    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,
    /// Time the job was dispatched
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Device the job was dispatched to
    pub assigned_gpu_id: Option<u32>,
    /// Captured output of the job
    pub log_path: Option<PathBuf>,
    /// Exit code or failure reason
    pub exit_info: Option<ExitInfo>,
}

impl Job {
    /// Create a new queued job
    pub fn new(
        id: Uuid,
        request: &JobRequest,
        script_path: PathBuf,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id: request.user_id.clone(),
            script_path,
            vram_required: request.vram_required,
            partition: request.partition.clone(),
            qos: request.qos.clone(),
            status: JobStatus::Queued,
            priority_score: 0.0,
            submitted_at,
            started_at: None,
            completed_at: None,
            assigned_gpu_id: None,
            log_path: None,
            exit_info: None,
        }
    }

    /// Whether the job reached COMPLETED or FAILED
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Most recent lifecycle timestamp
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.completed_at
            .or(self.started_at)
            .unwrap_or(self.submitted_at)
    }

    /// Update the priority score. Scores are frozen once the job leaves the queue.
    pub fn set_priority_score(&mut self, score: f64) -> bool {
        if self.status == JobStatus::Queued {
            self.priority_score = score;
            true
        } else {
            false
        }
    }

    /// Apply a transition in place.
    ///
    /// Nothing is modified when the transition is rejected.
    pub fn apply(&mut self, transition: &Transition) -> GpuschedResult<()> {
        if !self.status.can_transition_to(transition.to) {
            return Err(GpuschedError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: transition.to,
            });
        }
        transition.validate()?;

        set_once(&mut self.assigned_gpu_id, transition.assigned_gpu_id);
        set_once(&mut self.started_at, transition.started_at);
        set_once(&mut self.completed_at, transition.completed_at);
        set_once(&mut self.log_path, transition.log_path.clone());
        set_once(&mut self.exit_info, transition.exit_info.clone());
        self.status = transition.to;

        Ok(())
    }
}

fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a device
    Queued,
    /// Dispatched to a device and executing
    Running,
    /// Exited with code zero
    Completed,
    /// Could not start, or exited unsuccessfully
    Failed,
}

impl JobStatus {
    /// Whether no further transitions are allowed
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Allowed edges of the state machine
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = GpuschedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(GpuschedError::Validation(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Outcome recorded when a job reaches a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Process exit code, absent when the process never ran or was killed by a signal
    pub exit_code: Option<i32>,
    /// Human-readable outcome
    pub reason: String,
    /// Last lines of the job output, stderr included
    pub stderr_tail: Option<String>,
}

impl ExitInfo {
    /// Process exited with the given code
    pub fn exited(exit_code: Option<i32>, stderr_tail: Option<String>) -> Self {
        let reason = match exit_code {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        };
        Self {
            exit_code,
            reason,
            stderr_tail,
        }
    }

    /// Failure without an exit code
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            reason: reason.into(),
            stderr_tail: None,
        }
    }

    /// Whether the process exited with code zero
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A status change together with the fields it sets
#[derive(Debug, Clone)]
pub struct Transition {
    pub to: JobStatus,
    pub assigned_gpu_id: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub log_path: Option<PathBuf>,
    pub exit_info: Option<ExitInfo>,
}

impl Transition {
    /// QUEUED -> RUNNING on the given device
    pub fn start(gpu_id: u32, log_path: PathBuf, at: DateTime<Utc>) -> Self {
        Self {
            to: JobStatus::Running,
            assigned_gpu_id: Some(gpu_id),
            started_at: Some(at),
            completed_at: None,
            log_path: Some(log_path),
            exit_info: None,
        }
    }

    /// Terminal transition derived from the exit outcome
    pub fn finish(exit_info: ExitInfo, at: DateTime<Utc>) -> Self {
        let to = if exit_info.is_success() {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        Self {
            to,
            assigned_gpu_id: None,
            started_at: None,
            completed_at: Some(at),
            log_path: None,
            exit_info: Some(exit_info),
        }
    }

    /// Transition to FAILED regardless of exit code
    pub fn fail(exit_info: ExitInfo, at: DateTime<Utc>) -> Self {
        Self {
            to: JobStatus::Failed,
            assigned_gpu_id: None,
            started_at: None,
            completed_at: Some(at),
            log_path: None,
            exit_info: Some(exit_info),
        }
    }

    fn validate(&self) -> GpuschedResult<()> {
        let complete = match self.to {
            JobStatus::Queued => false,
            JobStatus::Running => self.assigned_gpu_id.is_some() && self.started_at.is_some(),
            JobStatus::Completed | JobStatus::Failed => {
                self.completed_at.is_some() && self.exit_info.is_some()
            }
        };
        if complete {
            Ok(())
        } else {
            Err(GpuschedError::Internal(format!(
                "transition to {} is missing required fields",
                self.to
            )))
        }
    }
}

/// A job submission
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub user_id: String,
    /// Original file name of the uploaded script, if known
    pub script_name: Option<String>,
    /// Script contents
    pub script: Vec<u8>,
    pub vram_required: u64,
    pub partition: String,
    pub qos: String,
}

impl JobRequest {
    /// Reject missing or malformed submission fields
    pub fn validate(&self) -> GpuschedResult<()> {
        if self.script.is_empty() {
            return Err(GpuschedError::Validation(
                "script artifact is missing or empty".to_string(),
            ));
        }
        for (field, value) in [
            ("user_id", &self.user_id),
            ("partition", &self.partition),
            ("qos", &self.qos),
        ] {
            if value.trim().is_empty() {
                return Err(GpuschedError::Validation(format!("{} must not be empty", field)));
            }
            if value.chars().any(char::is_control) {
                return Err(GpuschedError::Validation(format!(
                    "{} contains control characters",
                    field
                )));
            }
        }
        Ok(())
    }

    /// Whether the script starts with an interpreter line
    pub fn has_interpreter_line(&self) -> bool {
        self.script.starts_with(b"#!")
    }
}
