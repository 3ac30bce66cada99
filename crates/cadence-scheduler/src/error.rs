use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduling pattern text could not be parsed, or never matches.
    #[error("Invalid scheduling pattern '{pattern}': {reason}")]
    InvalidSchedulingPattern { pattern: String, reason: String },

    /// A job with this ID already exists in the store.
    #[error("Duplicate job: {id}")]
    DuplicateJob { id: String },

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job implementation itself returned an error.
    #[error("Job {id} failed: {source}")]
    JobExecutionFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// No factory is registered for the job's implementation reference.
    #[error("No job implementation registered for class '{job_class}'")]
    JobClassNotRegistered { job_class: String },

    /// A required field is missing or a value is out of bounds.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying SQLite / rusqlite error. The whole tick may be retried.
    #[error("Scheduler unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
}

impl SchedulerError {
    /// Short error code string for administrative callers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidSchedulingPattern { .. } => "INVALID_SCHEDULING_PATTERN",
            SchedulerError::DuplicateJob { .. } => "DUPLICATE_JOB",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::JobExecutionFailed { .. } => "JOB_EXECUTION_FAILED",
            SchedulerError::JobClassNotRegistered { .. } => "JOB_CLASS_NOT_REGISTERED",
            SchedulerError::InvalidArgument(_) => "INVALID_ARGUMENT",
            SchedulerError::Unavailable(_) => "SCHEDULER_UNAVAILABLE",
        }
    }

    pub(crate) fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        SchedulerError::InvalidSchedulingPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
