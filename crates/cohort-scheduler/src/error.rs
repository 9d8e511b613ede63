//! Error types for the scheduler.

use thiserror::Error;

use crate::node::NodeState;

/// Boxed error returned by user job bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by a store backend.
///
/// Lost optimistic-concurrency races are not errors; they are reported as
/// [`WriteOutcome::Conflict`](crate::WriteOutcome::Conflict).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record not found.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The node is not registered in the scheduler metadata store.
    #[error("scheduler not registered: {0}")]
    NotRegistered(String),

    /// Backend failure (connection, serialization, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors from the worker pool admission check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// All workers are busy.
    #[error("task rejected: no free worker")]
    TaskRejected,

    /// The pool has been closed.
    #[error("worker pool is closed")]
    Closed,
}

/// Errors from the job factory.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// No constructor registered for the job class.
    #[error("unknown job class: {0}")]
    UnknownJobClass(String),

    /// The registered constructor failed.
    #[error("failed to construct job {class}: {reason}")]
    Construction { class: String, reason: String },
}

/// Errors from next-execution calculation.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The schedule could not produce a next delta.
    #[error("next execution calculation failed: {0}")]
    Calculation(String),
}

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker pool error.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// Lifecycle operation called in the wrong state.
    #[error("invalid scheduler state: required {required}, current {current}")]
    InvalidState {
        required: NodeState,
        current: NodeState,
    },

    /// Operation on a disposed scheduler.
    #[error("scheduler {0} has been disposed")]
    Disposed(String),

    /// Invalid configuration.
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// Registering the node in the metadata store failed.
    #[error("failed to register scheduler {node}: {source}")]
    Registration {
        node: String,
        #[source]
        source: StoreError,
    },
}
