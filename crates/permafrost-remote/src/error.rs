//! # Design
//!
//! - Structured, constant-message errors for every external collaborator.
//! - Capture the operation and endpoint so failures are reproducible.
//! - Preserve source errors without interpolating context into messages.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for remote-collaborator operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors produced while talking to external collaborators.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// HTTP transport failures.
    #[error("remote http failure")]
    Http {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Request URL.
        url: String,
        /// Underlying reqwest error.
        source: reqwest::Error,
    },
    /// The peer answered with an unexpected status code.
    #[error("remote unexpected status")]
    UnexpectedStatus {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Request URL.
        url: String,
        /// Status code received.
        status: u16,
    },
    /// Downloaded content did not match the expected hash.
    #[error("remote content hash mismatch")]
    HashMismatch {
        /// Request URL the content came from.
        url: String,
        /// Hash the obligations model promised.
        expected: String,
        /// Hash of the bytes actually received.
        actual: String,
    },
    /// Local IO failures while spooling remote data.
    #[error("remote io failure")]
    Io {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Local path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// An external subprocess exited unsuccessfully.
    #[error("remote subprocess failure")]
    Subprocess {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Program that was invoked.
        program: &'static str,
        /// Exit code, when the process exited at all.
        code: Option<i32>,
        /// Captured standard error output.
        stderr: String,
    },
    /// A collaborator-specific failure that carries no structured context.
    #[error("remote backend failure")]
    Backend {
        /// Operation that triggered the failure.
        operation: &'static str,
        /// Backend-provided detail.
        detail: String,
    },
}

impl RemoteError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Build a backend failure with free-form detail.
    #[must_use]
    pub fn backend(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            detail: detail.into(),
        }
    }
}
