//! Error taxonomy of the harness.
//!
//! Failures raised by a [`crate::Task`] are [`TaskError`]s. The lane loop
//! classifies each one as transient (recorded, backed off, retried) or fatal
//! (recorded once and propagated out of the lane as a [`LaneError`]). Only the
//! drain pass ever observes lane failures, as [`DrainError`]s.
use std::error::Error as StdError;

use thiserror::Error;

use crate::workload::Problem;

/// Boxed error used for failures the harness does not need to inspect.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// An error reported by the backend under test, carrying its error code
/// (a SQLSTATE for SQL databases).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("backend error [{code}]: {message}")]
pub struct BackendError {
    pub code: String,
    pub message: String,
}

impl BackendError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Failure of a single unit of work.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task layer's own retryable kind. Always treated as transient.
    #[error("recoverable: {0}")]
    Recoverable(String),

    /// A backend error, classified by the configured [`crate::ErrorClassifier`].
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Anything else. Fatal unless its cause chain holds a transient backend error.
    #[error("{0}")]
    Other(#[source] BoxError),
}

impl TaskError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    pub fn other<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Other(Box::new(error))
    }

    /// The innermost [`BackendError`] found in this error or its cause chain.
    pub fn backend_cause(&self) -> Option<&BackendError> {
        match self {
            TaskError::Recoverable(_) => None,
            TaskError::Backend(e) => Some(e),
            TaskError::Other(e) => {
                let mut innermost = None;
                let mut current: Option<&(dyn StdError + 'static)> = Some(e.as_ref());
                while let Some(err) = current {
                    if let Some(backend) = err.downcast_ref::<BackendError>() {
                        innermost = Some(backend);
                    }
                    current = err.source();
                }
                innermost
            }
        }
    }
}

/// Description of the innermost cause of `error`, or of `error` itself when it
/// has no cause.
pub fn root_cause(error: &(dyn StdError + 'static)) -> String {
    let mut current = error;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

/// A fatal failure that terminated one lane.
#[derive(Debug, Error)]
#[error("workload '{workload}' aborted: {source}")]
pub struct LaneError {
    pub workload: String,
    /// The problem the lane recorded for the failing call.
    pub problem: Problem,
    #[source]
    pub source: TaskError,
}

/// Failure observed while joining a lane at shutdown.
#[derive(Debug, Error)]
pub enum DrainError {
    #[error(transparent)]
    Fatal(#[from] LaneError),

    #[error("workload '{workload}' panicked: {message}")]
    Panicked { workload: String, message: String },

    #[error("workload '{0}' was cancelled before completing")]
    Cancelled(String),
}

impl DrainError {
    /// The problem to record against the workload's terminal status.
    pub fn problem(&self) -> Problem {
        match self {
            DrainError::Fatal(e) => e.problem.clone(),
            other => Problem::from_error(other),
        }
    }
}

/// Errors returned by the [`crate::WorkloadManager`].
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("workload manager is shut down and accepts no further workloads")]
    ShutDown,

    #[error("batch size must be greater than zero")]
    InvalidBatchSize,
}
