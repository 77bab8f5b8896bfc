//! Application-level error surface.

use std::path::PathBuf;

use permafrost_archive::ArchiveError;
use permafrost_sync::SyncError;
use permafrost_tracking::TrackingError;
use thiserror::Error;

/// Result type returned by application entry points.
pub type AppResult<T> = Result<T, AppError>;

/// Failures surfaced while bootstrapping or running the node.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file")]
    ConfigRead {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file")]
    ConfigParse {
        /// Path of the configuration file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_yaml::Error,
    },

    /// Configuration was parsed but is semantically invalid.
    #[error("invalid configuration: {detail}")]
    ConfigInvalid {
        /// What is wrong with the configuration.
        detail: String,
    },

    /// Logging could not be installed.
    #[error("failed to install the tracing subscriber")]
    Telemetry {
        /// Subscriber-provided detail.
        detail: String,
    },

    /// The HTTP peer client could not be constructed.
    #[error("failed to build the peer client")]
    PeerClient {
        /// Underlying remote error.
        #[source]
        source: permafrost_remote::RemoteError,
    },

    /// Archival pipeline failure.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Sync or cleanup failure.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Trackfile failure.
    #[error(transparent)]
    Tracking(#[from] TrackingError),
}

impl AppError {
    pub(crate) fn invalid(detail: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            detail: detail.into(),
        }
    }
}
