#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Crash-safe, lock-protected, append-only tracking of durable milestones.
//!
//! Two specializations share one generic [`TrackfileStore`]: the object store
//! records which data objects have been durably handled (with tombstones for
//! untracking), the archives store records which archives have been built and
//! confirmed uploaded. Both reload identically from their logs after a crash.
//! Cross-process mutual exclusion is provided by an advisory lock on a sibling
//! `.lock` file, acquired with bounded retry.

mod archives;
mod error;
mod objects;
mod trackfile;

pub use archives::{ARCHIVES_TRACKING_FILENAME, ArchivesTrackingStore, ObjectSearch};
pub use error::{TrackingError, TrackingResult};
pub use objects::{OBJECTS_TRACKING_FILENAME, ObjectTrackingStore};
pub use trackfile::{EntryCodec, LockRetryPolicy, TrackfileStore};
