//! Error surface of the archival orchestrator.

use std::path::PathBuf;

use permafrost_remote::RemoteError;
use permafrost_tracking::TrackingError;
use thiserror::Error;

/// Convenience alias for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Failures surfaced by the archival pipeline.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Local filesystem operation failed.
    #[error("archive filesystem operation failed")]
    Io {
        /// Operation label for diagnostics.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A remote collaborator call failed.
    #[error("remote call failed")]
    Remote {
        /// Operation label for diagnostics.
        operation: &'static str,
        /// Underlying remote error.
        #[source]
        source: RemoteError,
    },

    /// Trackfile operation failed.
    #[error(transparent)]
    Tracking(#[from] TrackingError),

    /// An archive member name did not parse as a data object id.
    #[error("archive member is not a data object id")]
    InvalidArchiveMember {
        /// Archive whose listing produced the member.
        archive: String,
        /// The offending member name.
        member: String,
    },
}

impl ArchiveError {
    pub(crate) fn io(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn remote(operation: &'static str, source: RemoteError) -> Self {
        Self::Remote { operation, source }
    }
}
