//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job execution failed.
    #[error("job execution failed: {0}")]
    ExecutionFailed(String),

    /// Job timed out.
    #[error("job timed out after {0:.3}s")]
    Timeout(f64),

    /// No handler registered under the descriptor's class name.
    #[error("no handler registered for class: {0}")]
    UnknownClass(String),

    /// Cron expression could not be parsed or evaluated.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl JobError {
    /// Returns true if the failure can never succeed on a retry.
    ///
    /// Permanent failures go straight to the failed list; everything
    /// else flows through the retry state machine.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            JobError::UnknownClass(_) | JobError::InvalidCron(_) | JobError::Configuration(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_classification() {
        assert!(JobError::UnknownClass("X".into()).is_permanent());
        assert!(!JobError::ExecutionFailed("boom".into()).is_permanent());
        assert!(!JobError::Timeout(5.0).is_permanent());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = JobError::ExecutionFailed("connection reset".into());
        assert!(err.to_string().contains("connection reset"));
    }
}
