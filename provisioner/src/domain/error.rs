//! Typed error enums for the provisioner.
//!
//! This module has zero imports from `crate::infra` or `crate::application`.
//! Adapters classify failures into [`BackendError`]; the engine turns those
//! into [`ProvisionError`] with the operation and object attached.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

// ── Backend errors ────────────────────────────────────────────────────────────

/// Failure classification every cluster backend adapter produces.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object not found")]
    NotFound,

    /// The version token supplied on update is stale.
    #[error("update out of sequence: {0}")]
    Conflict(String),

    /// Cluster init or join against a node that is already a member.
    #[error("node is already part of a cluster")]
    AlreadyMember,

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

impl BackendError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound)
    }
}

// ── Engine errors ─────────────────────────────────────────────────────────────

/// Why an ephemeral task failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The instance ran and exited non-zero.
    ExitCode(i64),
    /// The backend put the task in a failed or rejected state.
    Status(String),
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskFailure::ExitCode(code) => write!(f, "unexpected exit code {code}"),
            TaskFailure::Status(msg) => write!(f, "{msg}"),
        }
    }
}

/// Errors surfaced by every engine operation.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("unit '{0}' not found")]
    UnitNotFound(String),

    #[error("app '{0}' has no running units")]
    EmptyApp(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("cannot scale by {increment}: current replica count is {current}")]
    InvalidScale { current: u64, increment: i64 },

    #[error("conflicting update of {object}: {message}")]
    Conflict { object: String, message: String },

    #[error("task for {object} failed: {failure}")]
    TaskFailed {
        object: String,
        failure: TaskFailure,
    },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("no cluster available")]
    BackendUnavailable,

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    #[error("{operation} {object}: {source}")]
    Transport {
        operation: &'static str,
        object: String,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),

    #[error(transparent)]
    Multiple(#[from] MultiError),
}

impl ProvisionError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::Conflict { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProvisionError::NotFound { .. } | ProvisionError::UnitNotFound(_)
        )
    }

    /// Exit code of a failed ephemeral run, if it got that far.
    #[must_use]
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            ProvisionError::TaskFailed {
                failure: TaskFailure::ExitCode(code),
                ..
            } => Some(*code),
            _ => None,
        }
    }
}

/// Wraps a [`BackendError`] with the operation and object it concerned.
pub trait BackendResultExt<T> {
    /// # Errors
    ///
    /// `NotFound` and `Conflict` keep their meaning; every other failure
    /// becomes `Transport`.
    fn op(self, operation: &'static str, object: &str) -> Result<T, ProvisionError>;
}

impl<T> BackendResultExt<T> for Result<T, BackendError> {
    fn op(self, operation: &'static str, object: &str) -> Result<T, ProvisionError> {
        self.map_err(|source| match source {
            BackendError::NotFound => ProvisionError::NotFound {
                kind: "object",
                name: object.to_string(),
            },
            BackendError::Conflict(message) => ProvisionError::Conflict {
                object: object.to_string(),
                message,
            },
            BackendError::Unsupported { operation, backend } => {
                ProvisionError::Unsupported { operation, backend }
            }
            source => ProvisionError::Transport {
                operation,
                object: object.to_string(),
                source,
            },
        })
    }
}

// ── Accumulated errors ────────────────────────────────────────────────────────

/// Per-object failures collected by multi-object operations.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<ProvisionError>,
}

impl MultiError {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: ProvisionError) {
        self.errors.push(err);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ProvisionError] {
        &self.errors
    }

    /// `Ok` when nothing was collected, the error itself when exactly one
    /// was, and the combined report otherwise.
    ///
    /// # Errors
    ///
    /// Returns the collected failures.
    pub fn into_result(mut self) -> Result<(), ProvisionError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(ProvisionError::Multiple(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            write!(f, "\n  {}. {err}", i + 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
