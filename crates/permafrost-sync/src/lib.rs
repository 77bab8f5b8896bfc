//! Download orchestration and replication-safe pruning.
//!
//! The synchronizer diffs the obligations snapshot against the tracked
//! object set and builds download tasks for everything the node owes but
//! does not yet hold. The cleanup service runs the opposite diff, pruning
//! local objects that are no longer owed, gated on peer replication.

mod cleanup;
mod error;
mod synchronizer;
mod tasks;

pub use cleanup::{CleanupConfig, CleanupService, CleanupSummary};
pub use error::{SyncError, SyncResult};
pub use synchronizer::{SyncDirs, added_objects, build_download_task, candidate_urls};
pub use tasks::{DeleteLocalFileTask, DownloadFileTask, DownloadOutcome, SyncTask};
