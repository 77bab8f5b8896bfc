//! Error surface of the sync and cleanup orchestrators.

use std::path::PathBuf;

use permafrost_model::DataObjectId;
use permafrost_remote::RemoteError;
use permafrost_tracking::TrackingError;
use thiserror::Error;

/// Convenience alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failures surfaced by the synchronizer and cleanup service.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local filesystem operation failed.
    #[error("sync filesystem operation failed")]
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

    /// Every candidate peer failed to serve the object this cycle.
    #[error("all download candidates exhausted")]
    DownloadExhausted {
        /// Object that could not be downloaded.
        id: DataObjectId,
        /// Number of candidate URLs attempted.
        attempts: usize,
    },

    /// The obligations source lags too far behind the chain to act on.
    #[error("obligations source is stale")]
    StaleObligations {
        /// Observed processing lag in blocks.
        lag: u64,
        /// Maximum tolerated lag in blocks.
        threshold: u64,
    },
}

impl SyncError {
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
