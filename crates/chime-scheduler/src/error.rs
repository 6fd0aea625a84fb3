//! Error types for the scheduler.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job's schedule type or config cannot produce a fire time.
    ///
    /// Never returned from the engine itself: a job in this state is left
    /// unscheduled and the sibling jobs are unaffected.
    #[error("job {job_id} cannot be scheduled: {reason}")]
    Unschedulable { job_id: String, reason: String },

    /// A persisted file exists but could not be decoded.
    #[error("corrupt persisted state in {}: {source}", path.display())]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Paused jobs cannot be executed manually.
    #[error("job is paused: {0}")]
    JobPaused(String),

    /// Invalid job definition.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The engine task is no longer running.
    #[error("scheduler engine has stopped")]
    EngineStopped,
}

impl SchedulerError {
    pub(crate) fn unschedulable(job_id: &str, reason: impl Into<String>) -> Self {
        Self::Unschedulable {
            job_id: job_id.to_string(),
            reason: reason.into(),
        }
    }
}
