//! External collaborators of the lifecycle engine, behind swappable traits.
//!
//! The engine consumes three remote surfaces: the obligations source (what
//! must be stored), the blob store (where cold archives go), and peer
//! storage nodes (where objects are downloaded from and probed on). Concrete
//! backends live behind the traits here so the engine never depends on a
//! particular RPC layer, SDK, or compression algorithm.

mod compress;
mod error;
mod peer;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use permafrost_model::{BucketId, DataObjectId, ObligationsModel};

pub use compress::TarCompressor;
pub use error::{RemoteError, RemoteResult};
pub use peer::PeerClient;

/// Storage class hint for blob-store uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// Frequently accessed, often overwritten objects (e.g. trackfile backups).
    Standard,
    /// Cold archival storage for data expected to be read rarely.
    DeepArchive,
}

/// Current holders of a data object, used for replication probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocations {
    /// The object in question.
    pub id: DataObjectId,
    /// Operator URLs of buckets currently assigned the object's bag.
    pub operator_urls: Vec<String>,
}

/// Source of chain-determined storage obligations.
///
/// Snapshots are consumed read-only and polled once per sync/cleanup pass.
#[async_trait]
pub trait ObligationsSource: Send + Sync {
    /// Fetch the obligations snapshot for the given buckets.
    async fn fetch(&self, buckets: &[BucketId]) -> RemoteResult<ObligationsModel>;

    /// Of the given candidates, the ids confirmed deleted system-wide.
    async fn deleted_object_ids(
        &self,
        candidates: &[DataObjectId],
    ) -> RemoteResult<Vec<DataObjectId>>;

    /// Current holders of the given objects (for replication probing).
    async fn object_locations(
        &self,
        ids: &[DataObjectId],
    ) -> RemoteResult<Vec<ObjectLocations>>;

    /// How many blocks the source's processing lags behind the chain head.
    async fn processing_lag(&self) -> RemoteResult<u64>;
}

/// Remote blob-store connection. Keys are opaque strings.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload a local file under the given key. At-least-once semantics:
    /// re-uploading an existing key must be accepted.
    async fn upload_file(
        &self,
        key: &str,
        local_path: &Path,
        storage_class: Option<StorageClass>,
    ) -> RemoteResult<()>;

    /// List the keys currently present in the remote bucket.
    async fn list_files(&self) -> RemoteResult<Vec<String>>;

    /// Remove an object by key.
    async fn remove_object(&self, key: &str) -> RemoteResult<()>;

    /// Pre-signed or redirect URL for downloading an object.
    async fn redirect_url(&self, key: &str) -> RemoteResult<String>;
}

/// Archive compression behind one interface; the engine never depends on a
/// specific algorithm.
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Compress the given files into a new archive at `archive_path`.
    async fn compress_files(
        &self,
        paths: &[PathBuf],
        archive_path: &Path,
        level: Option<u32>,
    ) -> RemoteResult<()>;

    /// List the member file names of an existing archive.
    async fn list_files(&self, archive_path: &Path) -> RemoteResult<Vec<String>>;

    /// File extension produced by this compressor (e.g. `tar.zst`).
    fn extension(&self) -> &'static str;
}
