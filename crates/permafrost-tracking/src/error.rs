//! # Design
//!
//! - Structured, constant-message errors for the tracking layer.
//! - Capture the trackfile path and operation so failures are reproducible.
//! - Preserve source errors without interpolating context into messages.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for tracking operations.
pub type TrackingResult<T> = Result<T, TrackingError>;

/// Errors produced by the trackfile stores.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// IO failures while interacting with a trackfile.
    #[error("tracking io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Trackfile path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// The advisory lock could not be acquired within the retry budget.
    #[error("tracking lock acquisition timed out")]
    LockTimeout {
        /// Lock file path.
        path: PathBuf,
        /// Number of acquisition attempts made.
        attempts: u32,
    },
    /// A trackfile line could not be decoded.
    #[error("tracking corrupt entry")]
    CorruptEntry {
        /// Trackfile path containing the entry.
        path: PathBuf,
        /// One-based line number of the entry.
        line_number: usize,
        /// Static-free description of the decode failure.
        detail: String,
    },
    /// An entry could not be encoded for appending.
    #[error("tracking entry encoding failed")]
    EncodeFailure {
        /// Trackfile path the entry was destined for.
        path: PathBuf,
        /// Description of the encode failure.
        detail: String,
    },
}

impl TrackingError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}
