//! Unified error type for the lxcompose workspace.
//!
//! Every component returns [`LxError`]. The variants mirror the error
//! kinds callers need to distinguish: bad input, illegal transitions,
//! missing or duplicate entities, persistence failures, and failures of
//! the external container runtime.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ContainerStatus;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum LxError {
    /// The container specification is malformed or contradictory.
    #[error("invalid specification: {message}")]
    Validation {
        /// Description of the rejected input.
        message: String,
    },

    /// The operation is not legal from the container's current status.
    #[error("cannot {operation} container {name}: container is {status}")]
    InvalidState {
        /// Container name.
        name: String,
        /// Attempted operation.
        operation: &'static str,
        /// Status the container was in.
        status: ContainerStatus,
    },

    /// A required container or template was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A container or template with this name already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Type of the duplicate resource.
        kind: &'static str,
        /// Identifier of the duplicate resource.
        id: String,
    },

    /// Persisting state to disk failed.
    #[error("storage error at {path}: {source}")]
    Storage {
        /// Path being persisted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A filesystem operation on a container artifact failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The external runtime command ran and reported failure.
    #[error("{operation} of container {name} failed (exit code {exit_code}): {output}")]
    Runtime {
        /// Container name.
        name: String,
        /// Attempted runtime operation.
        operation: &'static str,
        /// Exit code of the command, `-1` when killed by a signal.
        exit_code: i32,
        /// Captured standard output and standard error.
        output: String,
    },

    /// The external program could not be spawned or waited on.
    #[error("failed to run {program}: {source}")]
    System {
        /// Program that failed to run.
        program: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },

    /// The caller cancelled the operation or its deadline passed.
    #[error("{operation} cancelled")]
    Cancelled {
        /// Operation that was interrupted.
        operation: &'static str,
    },

    /// A retried operation kept failing until the policy gave up.
    #[error("gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error returned by the last attempt.
        source: Box<LxError>,
    },

    /// One step of a multi-step operation failed.
    #[error("{operation} failed at {step} step: {source}")]
    Step {
        /// Multi-step operation being executed.
        operation: &'static str,
        /// Step that failed.
        step: &'static str,
        /// Error returned by the failed step.
        source: Box<LxError>,
    },
}

impl LxError {
    /// Shorthand for a [`LxError::Validation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Returns whether retrying the failed operation may succeed.
    ///
    /// Only persistence and process-level failures are transient;
    /// validation, state and runtime exit-code errors are permanent.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. } | Self::Io { .. } | Self::System { .. }
        )
    }

    /// Returns the innermost error, unwrapping retry and step wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::RetryExhausted { source, .. } | Self::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, LxError>;
