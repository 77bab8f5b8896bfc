//! In-memory fakes and fixtures shared by the engine's test suites.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use permafrost_model::{BucketId, DataObjectId, ObligationsModel};
use permafrost_remote::{
    BlobStore, ObjectLocations, ObligationsSource, RemoteError, RemoteResult, StorageClass,
};
use sha2::{Digest, Sha256};

/// Fixed [`ObligationsSource`] returning preconfigured answers.
#[derive(Default)]
pub struct StaticObligations {
    model: ObligationsModel,
    deleted: Vec<DataObjectId>,
    locations: Vec<ObjectLocations>,
    lag: u64,
}

impl StaticObligations {
    /// Source answering `fetch` with the given snapshot.
    #[must_use]
    pub fn new(model: ObligationsModel) -> Self {
        Self {
            model,
            deleted: Vec::new(),
            locations: Vec::new(),
            lag: 0,
        }
    }

    /// Set the reported processing lag.
    #[must_use]
    pub fn with_lag(mut self, lag: u64) -> Self {
        self.lag = lag;
        self
    }

    /// Set the ids reported as deleted system-wide.
    #[must_use]
    pub fn with_deleted(mut self, deleted: Vec<DataObjectId>) -> Self {
        self.deleted = deleted;
        self
    }

    /// Set the known holders of moved objects.
    #[must_use]
    pub fn with_locations(mut self, locations: Vec<ObjectLocations>) -> Self {
        self.locations = locations;
        self
    }
}

#[async_trait]
impl ObligationsSource for StaticObligations {
    async fn fetch(&self, _buckets: &[BucketId]) -> RemoteResult<ObligationsModel> {
        Ok(self.model.clone())
    }

    async fn deleted_object_ids(
        &self,
        candidates: &[DataObjectId],
    ) -> RemoteResult<Vec<DataObjectId>> {
        Ok(self
            .deleted
            .iter()
            .copied()
            .filter(|id| candidates.contains(id))
            .collect())
    }

    async fn object_locations(&self, ids: &[DataObjectId]) -> RemoteResult<Vec<ObjectLocations>> {
        Ok(self
            .locations
            .iter()
            .filter(|location| ids.contains(&location.id))
            .cloned()
            .collect())
    }

    async fn processing_lag(&self) -> RemoteResult<u64> {
        Ok(self.lag)
    }
}

/// In-memory [`BlobStore`] capturing uploads for assertions.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_uploads: AtomicBool,
    upload_count: AtomicUsize,
}

impl MemoryBlobStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent uploads fail until reset.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Whether a key has been uploaded.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Bytes stored under a key, if any.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of successful uploads accepted so far.
    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.upload_count.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload_file(
        &self,
        key: &str,
        local_path: &Path,
        _storage_class: Option<StorageClass>,
    ) -> RemoteResult<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::backend("upload", "simulated upload failure"));
        }
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|source| RemoteError::Io {
                operation: "upload.read",
                path: local_path.to_path_buf(),
                source,
            })?;
        self.lock().insert(key.to_string(), bytes);
        self.upload_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_files(&self) -> RemoteResult<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }

    async fn remove_object(&self, key: &str) -> RemoteResult<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn redirect_url(&self, key: &str) -> RemoteResult<String> {
        Ok(format!("memory://{key}"))
    }
}

/// Hex-encoded SHA-256 of the given bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write `bytes` under the object's canonical file name in `dir`.
pub fn write_object_file(dir: &Path, id: DataObjectId, bytes: &[u8]) -> PathBuf {
    let path = dir.join(id.to_string());
    std::fs::write(&path, bytes).unwrap_or_else(|err| panic!("write {}: {err}", path.display()));
    path
}
