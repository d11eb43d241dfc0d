//! Error taxonomy for the workbench. Every external boundary surfaces one of
//! these as a single string plus a status class; stack traces never leak.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkbenchError {
    /// Worktree path or session id absent.
    #[error("{0}")]
    NotFound(String),
    /// Target already exists (e.g. worktree creation collision).
    #[error("{0}")]
    Conflict(String),
    /// Missing required input, or a mode that cannot be satisfied
    /// (e.g. tmux requested but not installed).
    #[error("{0}")]
    PreconditionFailed(String),
    /// git/tmux/gh/SDK invocation failure; message carries trimmed stderr.
    #[error("{0}")]
    External(String),
    /// Command exceeded its hard timeout.
    #[error("{0}")]
    Timeout(String),
    /// Operation was aborted by the caller.
    #[error("{0}")]
    Cancelled(String),
    /// Invariant violation. Crashes the operation, never the process.
    #[error("{0}")]
    Internal(String),
}

impl WorkbenchError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn external(msg: impl Into<String>) -> Self {
        Self::External(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable class name used at the HTTP boundary and in logs.
    pub fn status_class(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::External(_) => "external",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T, E = WorkbenchError> = std::result::Result<T, E>;
