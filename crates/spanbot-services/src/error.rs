//! Error types for the service layer.

use thiserror::Error;

/// Errors raised by the cron and heartbeat services.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServiceError {
    /// No job with the given id exists.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The schedule definition could not be interpreted.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The job handler reported a failure.
    #[error("job execution failed: {0}")]
    Execution(String),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            ServiceError::JobNotFound("j1".into()).to_string(),
            "job not found: j1"
        );
        assert_eq!(
            ServiceError::InvalidSchedule("bad expr".into()).to_string(),
            "invalid schedule: bad expr"
        );
    }

    #[test]
    fn io_conversion() {
        let err: ServiceError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, ServiceError::Io(_)));
    }
}
