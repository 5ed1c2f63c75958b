//! Error types for skerry-core.

use crate::{ContextId, SandboxId};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for skerry-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during sandbox operations.
///
/// Failures of the submitted code or command itself (syntax errors,
/// non-zero exit codes) are not errors at this layer; they are carried as
/// data inside the execution results.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad parameters, rejected before any remote call is issued.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Sandbox never existed or has already been torn down.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(SandboxId),

    /// Sandbox reached its configured expiry without being extended.
    #[error("sandbox expired: {0}")]
    Expired(SandboxId),

    /// Code context was deleted or never existed on this sandbox.
    #[error("code context {context_id} not found on sandbox {sandbox_id}")]
    ContextNotFound {
        /// Parent sandbox
        sandbox_id: SandboxId,
        /// Missing context
        context_id: ContextId,
    },

    /// Path does not exist inside the sandbox filesystem.
    #[error("path not found: {0}")]
    FileNotFound(String),

    /// Path is malformed or escapes the sandbox root.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Operation disallowed in the current lifecycle state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// The command or runtime could not even be started.
    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    /// Local deadline exceeded; the remote outcome is unknown.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Retryable network or server condition.
    #[error("transient transport failure: {0}")]
    TransientTransport(String),

    /// Credential rejected by the backend.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Non-retryable connection problem surfaced by the transport.
    #[error("connection error: {0}")]
    Connection(String),

    /// Server-side failure surfaced unmodified.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Check if this error may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::TransientTransport(_))
    }

    /// Check if this error indicates a not-found or expired resource.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::SandboxNotFound(_)
                | CoreError::Expired(_)
                | CoreError::ContextNotFound { .. }
                | CoreError::FileNotFound(_)
        )
    }

    pub(crate) fn invalid_state(expected: impl Into<String>, actual: impl ToString) -> Self {
        CoreError::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }
}
