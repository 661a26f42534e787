// Error types for edit operations

use std::time::Duration;

use thiserror::Error;

use crate::worker::TaskError;

/// Result type alias for edit operations
pub type Result<T> = std::result::Result<T, EditError>;

/// Errors that can occur while writing, confirming or batching edits
///
/// `Clone` because every caller joined to a coalesced update chain receives
/// the same outcome.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EditError {
    /// Transient I/O failure reported by a remote resource
    #[error("request failed: {0}")]
    Request(String),

    /// A single consistency check did not observe the write yet
    #[error("not yet consistent: {0}")]
    NotConsistent(String),

    /// The consistency poller gave up waiting for the write to become visible
    #[error("consistency check timed out after {attempts} attempts ({elapsed:?})")]
    ConsistencyTimeout {
        attempts: u32,
        elapsed: Duration,
        /// Error of the last failed check, if one completed
        #[source]
        last_error: Option<Box<EditError>>,
    },

    /// An item of a batch failed permanently
    #[error("batch '{key}' item {index} failed: {source}")]
    BatchItem {
        key: String,
        index: usize,
        #[source]
        source: Box<EditError>,
    },

    /// The worker pool was dropped before the task settled
    #[error("worker pool is closed")]
    PoolClosed,

    /// The update chain ended without publishing an outcome
    #[error("update chain for {0} was abandoned")]
    ChainAbandoned(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EditError {
    /// Create a request error
    pub fn request(msg: impl Into<String>) -> Self {
        EditError::Request(msg.into())
    }

    /// Create a not-yet-consistent error
    pub fn not_consistent(msg: impl Into<String>) -> Self {
        EditError::NotConsistent(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        EditError::Configuration(msg.into())
    }

    /// Innermost error, unwrapping batch item wrappers
    pub fn root_cause(&self) -> &EditError {
        match self {
            EditError::BatchItem { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<TaskError<EditError>> for EditError {
    fn from(err: TaskError<EditError>) -> Self {
        match err {
            TaskError::Exhausted { source, .. } => source,
            TaskError::PoolClosed => EditError::PoolClosed,
        }
    }
}
