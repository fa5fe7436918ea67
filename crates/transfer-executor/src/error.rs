//! Executor error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Failure classes reported by a transfer executor.
///
/// The engine only distinguishes retryable from non-retryable failures; the
/// message is kept for the transfer record.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// Network/timeout class failure. Worth retrying.
    #[error("transient transfer failure: {0}")]
    Transient(String),

    /// Invalid path, bad credentials, missing source. Never retried.
    #[error("permanent transfer failure: {0}")]
    Permanent(String),

    /// The executor process could not be started.
    #[error("failed to spawn executor: {0}")]
    Spawn(#[from] std::io::Error),

    /// No progress was reported within the allowed window.
    #[error("transfer stalled: no progress for {0:?}")]
    Stalled(Duration),

    /// The transfer was stopped on request.
    #[error("transfer cancelled")]
    Cancelled,

    /// The executor produced output that could not be understood.
    #[error("unexpected executor output: {0}")]
    Protocol(String),
}

impl ExecutorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Stalled(_))
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ExecutorError::transient("reset by peer").is_retryable());
        assert!(ExecutorError::Stalled(Duration::from_secs(5)).is_retryable());
        assert!(!ExecutorError::permanent("no such bucket").is_retryable());
        assert!(!ExecutorError::Cancelled.is_retryable());
        assert!(!ExecutorError::Protocol("garbage".into()).is_retryable());
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "rclone");
        assert!(!ExecutorError::from(missing).is_retryable());
    }
}
