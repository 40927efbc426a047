//! # Error Types
//!
//! Structured error taxonomy for the coordination core, using thiserror
//! enums instead of `Box<dyn Error>` patterns.
//!
//! The taxonomy follows the system's failure semantics: validation failures
//! are always fatal to the triggering call, an out-of-memory worker exit is
//! the only retryable worker failure, and merge failures are caught at the
//! merge boundary instead of propagating out of the background task.

use thiserror::Error;

use crate::constants::OOM_EXIT_CODE;

/// Crate-wide error type covering every component boundary.
#[derive(Error, Debug)]
pub enum PlateflowError {
    /// Bad input that no retry can fix: unknown reference data, malformed
    /// image filenames, grid spec violations.
    #[error("validation error: {0}")]
    Validation(String),

    /// Grid spacing declared in a unit the catalog does not accept.
    #[error("unsupported unit for {axis} spacing: {unit:?} (expected {expected:?})")]
    UnsupportedUnit {
        axis: char,
        unit: String,
        expected: &'static str,
    },

    /// A linear site index outside `[1, nx*ny*nz*nt]`.
    #[error("site index {site_index} out of range 1..={max}")]
    SiteOutOfRange { site_index: i64, max: i64 },

    /// A `(experiment, batch id)` pair that already exists.
    #[error("batch {batch_id} already registered for experiment {experiment_id}")]
    DuplicateBatch { experiment_id: i64, batch_id: i64 },

    /// A lifecycle call made out of order, e.g. `mark_done` on a batch that
    /// never entered `processing`.
    #[error("invalid batch transition: {from} -> {to} (batch {batch_id})")]
    InvalidTransition {
        batch_id: i64,
        from: String,
        to: String,
    },

    /// Worker exited with the out-of-memory sentinel; retryable with a
    /// fresh batch id.
    #[error("worker ran out of memory on batch {batch_id} (attempt {attempt})")]
    TransientWorker { batch_id: i64, attempt: u32 },

    /// Worker exited nonzero with anything other than the OOM sentinel; not
    /// retried.
    #[error("worker failed on batch {batch_id} with exit code {exit_code}")]
    WorkerFailed { batch_id: i64, exit_code: i32 },

    /// Any failure inside the result-merging stage. Callers at the merge
    /// boundary convert this into a no-result instead of crashing.
    #[error("merge error: {0}")]
    Merge(String),

    /// Persistent store failure (query, connection, constraint).
    #[error("store error: {operation}: {message}")]
    Store { operation: String, message: String },

    /// Object storage failure (bucket, upload, download).
    #[error("object storage error: {operation}: {message}")]
    Storage { operation: String, message: String },

    /// Worker queue failure (enqueue, serialization).
    #[error("queue error: {0}")]
    Queue(String),

    /// Operator-initiated cancellation observed mid-batch. The batch is
    /// recorded as terminated before this is returned.
    #[error("batch {batch_id} terminated by cancellation")]
    Cancelled { batch_id: i64 },

    /// Progress requested for an experiment with no sites.
    #[error("experiment {experiment_id} has no sites")]
    NoSites { experiment_id: i64 },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PlateflowError {
    /// Shorthand for store failures wrapping an underlying driver error.
    pub fn store(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Store {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Shorthand for object storage failures.
    pub fn storage(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// Classify a nonzero worker exit code into the retryable/fatal split.
    pub fn from_worker_exit(batch_id: i64, exit_code: i32, attempt: u32) -> Self {
        if exit_code == OOM_EXIT_CODE {
            Self::TransientWorker { batch_id, attempt }
        } else {
            Self::WorkerFailed {
                batch_id,
                exit_code,
            }
        }
    }

    /// True when the dispatcher may resubmit under a fresh batch id.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientWorker { .. })
    }
}

impl From<sqlx::Error> for PlateflowError {
    fn from(err: sqlx::Error) -> Self {
        Self::store("sqlx", err)
    }
}

pub type Result<T> = std::result::Result<T, PlateflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_exit_is_retryable() {
        let err = PlateflowError::from_worker_exit(7, 137, 0);
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            PlateflowError::TransientWorker {
                batch_id: 7,
                attempt: 0
            }
        ));
    }

    #[test]
    fn other_nonzero_exit_is_fatal() {
        let err = PlateflowError::from_worker_exit(7, 1, 2);
        assert!(!err.is_retryable());
        assert!(matches!(
            err,
            PlateflowError::WorkerFailed {
                batch_id: 7,
                exit_code: 1
            }
        ));
    }
}
