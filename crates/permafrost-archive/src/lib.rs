//! Archival orchestration: queueing, compression, upload and recovery.
//!
//! The [`ArchiveService`] is the node's primary state machine. It drains the
//! obligations backlog through the download pipeline, batches downloaded
//! objects by size and age, compresses each batch through an external
//! process and uploads the result to cold storage, with trackfiles making
//! every step crash-recoverable.

mod error;
mod queue;
mod service;
mod tasks;

pub use error::{ArchiveError, ArchiveResult};
pub use queue::{DataObjectsQueue, QueueStats, UploadThresholds};
pub use service::{ArchiveConfig, ArchiveService};
pub use tasks::{
    ArchivePipeline, ArchiveTask, CompressAndUploadTask, UploadArchiveTask, archive_stem,
};
