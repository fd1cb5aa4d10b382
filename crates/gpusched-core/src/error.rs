//! Error types for gpusched

use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

/// Main error type for gpusched
#[derive(Error, Debug)]
pub enum GpuschedError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected submission
    #[error("Validation error: {0}")]
    Validation(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Scheduler error
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// GPU error
    #[error("GPU error: {0}")]
    Gpu(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// The job is not in a status that permits the requested transition
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpusched operations
pub type GpuschedResult<T> = Result<T, GpuschedError>;

impl From<serde_json::Error> for GpuschedError {
    fn from(err: serde_json::Error) -> Self {
        GpuschedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GpuschedError {
    fn from(err: toml::de::Error) -> Self {
        GpuschedError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpuschedError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");
    }

    #[test]
    fn test_invalid_transition_display() {
        let id = Uuid::nil();
        let err = GpuschedError::InvalidTransition {
            id,
            from: JobStatus::Completed,
            to: JobStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            format!("Invalid transition for job {}: COMPLETED -> RUNNING", id)
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GpuschedError = io_err.into();
        assert!(matches!(err, GpuschedError::Io(_)));
    }
}
