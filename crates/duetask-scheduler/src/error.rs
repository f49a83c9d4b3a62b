//! Error types for persistence, notification channels and job handlers.

use duetask_core::TaskStatus;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors raised by the task store and the job queue.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A thread panicked while holding the connection
    #[error("Connection lock poisoned")]
    LockPoisoned,

    /// A stored row could not be interpreted
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Backend temporarily unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Status change that would move a task backwards
    #[error("Cannot move task from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::CannotOpen
                        | ErrorCode::OutOfMemory
                )
            ),
            StoreError::Unavailable(_) => true,
            StoreError::Serialization(_)
            | StoreError::LockPoisoned
            | StoreError::Corrupt(_)
            | StoreError::InvalidTransition { .. } => false,
        }
    }
}

/// Errors that can occur when sending a push notification.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel is not configured
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// The API answered with a non-success status
    #[error("Push API error {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Classified failure of a job handler.
///
/// The job runner retries `Transient` failures with backoff and
/// dead-letters `Permanent` ones.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl JobError {
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        if e.is_transient() {
            JobError::Transient(e.to_string())
        } else {
            JobError::Permanent(e.to_string())
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::Sqlite(busy).is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!StoreError::Sqlite(constraint).is_transient());
    }

    #[test]
    fn test_job_error_classification() {
        let e: JobError = StoreError::Unavailable("down".into()).into();
        assert!(e.is_transient());

        let e: JobError = StoreError::Corrupt("bad status".into()).into();
        assert!(!e.is_transient());
    }
}
