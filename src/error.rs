//! Error types for orchestrator subsystems.
//!
//! Each subsystem gets its own `thiserror` enum rather than one catch-all,
//! so callers can match on the failure mode that actually matters to them.

use thiserror::Error;

/// Errors raised by the in-process task queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is shut down")]
    ShutDown,
}

/// Errors raised while dispatching or executing a task handler.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("unknown task tag: {0}")]
    UnknownTag(String),

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error(transparent)]
    Database(#[from] crate::storage::DatabaseError),

    #[error(transparent)]
    BuildState(#[from] BuildStateError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors raised by `Build` state transitions.
#[derive(Debug, Error)]
pub enum BuildStateError {
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },

    #[error("build {0} not found")]
    NotFound(i64),

    #[error("build {build_id} has no parent but one was required for buildtype {buildtype}")]
    MissingParent { build_id: i64, buildtype: String },
}

/// Errors raised by `SourceRepository` lifecycle operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository {0} not found")]
    NotFound(i64),

    #[error("repository {0} is not in the required state: {1}")]
    WrongState(i64, String),

    #[error("repository {0} still has project-version attachments or builds")]
    NotDeletable(i64),

    #[error("failed to parse repository url {0}")]
    UrlParse(String),
}

/// Errors raised by the Git collaborator wrapper.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {command} exited with status {status}")]
    CommandFailed { command: String, status: i32 },

    #[error("failed to spawn git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("no valid tag found")]
    NoValidTag,
}

/// Errors raised by the scheduler pass.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Database(#[from] crate::storage::DatabaseError),

    #[error(transparent)]
    BuildState(#[from] BuildStateError),
}
