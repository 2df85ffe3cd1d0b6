/// Core error taxonomy for the scheduler (§7 of the design spec).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Missing or malformed inputs at registration time (empty name, unknown backoff kind).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A cron expression could not be parsed.
    #[error("invalid schedule: {0}")]
    InvalidScheduleError(String),

    /// The storage backend could not be reached at all (connection loss).
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A storage operation failed after a connection was established.
    #[error("storage error: {0}")]
    StorageError(String),

    /// A job exhausted its retry budget; wraps the last underlying cause.
    #[error("job execution failed after all retries: {0}")]
    JobExecutionError(String),

    /// An operation referenced a job that does not exist in storage.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The storage URI scheme is not one of the supported backends.
    #[error("unsupported storage scheme: {0}")]
    UnsupportedStorage(String),

    /// A handler observed (or was asked to observe) cooperative cancellation.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidConfiguration(err.to_string())
    }
}

/// Result type alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
