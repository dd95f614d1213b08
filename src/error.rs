//! Error taxonomy for the calibration workflow.
//!
//! Validation-class errors carry every violation found so that a single
//! fix-and-retry cycle can address all of them. Execution-class errors are
//! raised at the first failure.

use crate::download::DownloadError;
use crate::scheduler::JobState;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file missing, unreadable or unparsable.
    #[error("failed to load configuration {}: {message}", .path.display())]
    ConfigLoad { path: PathBuf, message: String },

    /// One or more configuration values are missing or out of domain.
    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    ConfigValidation(Vec<String>),

    #[error("unknown stage '{name}' (available: {})", .available.join(", "))]
    UnknownStage { name: String, available: Vec<String> },

    #[error("empty stage range: '{start_from}' comes after '{stop_after}'")]
    EmptyRange {
        start_from: String,
        stop_after: String,
    },

    #[error("duplicate stage name '{0}' in pipeline")]
    DuplicateStage(String),

    /// Prerequisite checks failed for one or more selected stages.
    #[error("stage prerequisites not met:\n  - {}", .0.join("\n  - "))]
    StageValidation(Vec<String>),

    #[error("stage '{stage}' failed: {message}")]
    StageExecution { stage: String, message: String },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("job submission failed: {0}")]
    Submission(String),

    #[error("scheduler query failed: {0}")]
    Scheduler(String),

    #[error("batch job {job_id} ended in state {state}")]
    JobFailed { job_id: String, state: JobState },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Broad failure class, used for exit codes and result snapshots.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::ConfigLoad { .. }
            | Error::ConfigValidation(_)
            | Error::UnknownStage { .. }
            | Error::EmptyRange { .. }
            | Error::DuplicateStage(_)
            | Error::StageValidation(_) => FailureKind::Configuration,
            Error::Submission(_) => FailureKind::Submission,
            Error::JobFailed { .. } => FailureKind::JobExecution,
            Error::StageExecution { .. }
            | Error::Download(_)
            | Error::Scheduler(_)
            | Error::Io(_) => FailureKind::Runtime,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Individual messages, expanding aggregate errors into their parts.
    pub fn messages(&self) -> Vec<String> {
        match self {
            Error::ConfigValidation(errors) | Error::StageValidation(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

/// Failure class of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Runtime,
    Submission,
    JobExecution,
}

impl FailureKind {
    pub fn exit_code(self) -> i32 {
        match self {
            FailureKind::Configuration => 1,
            FailureKind::Runtime => 2,
            FailureKind::Submission => 3,
            FailureKind::JobExecution => 4,
        }
    }
}
