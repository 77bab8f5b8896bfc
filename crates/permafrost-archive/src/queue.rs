//! In-memory ledger of downloaded objects awaiting archival.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use permafrost_model::DataObjectId;
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};

#[derive(Debug, Clone, Copy)]
struct QueuedObject {
    size: u64,
    queued_at: SystemTime,
}

/// Derived accessors of the queue, used purely for trigger evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of queued objects.
    pub objects_count: usize,
    /// Combined size of queued objects in bytes.
    pub total_size: u64,
    /// Age of the oldest queued object, in whole minutes. Zero when empty.
    pub oldest_age_minutes: u64,
}

/// Ledger over the upload queue directory.
///
/// `add` stats the object's file and records its size and queueing time;
/// membership checks and removal are O(log n). Batching pops entries in
/// ascending id order while accumulating size, so every batch except
/// possibly the last crosses the size limit by at most one object.
pub struct DataObjectsQueue {
    dir: PathBuf,
    entries: Mutex<BTreeMap<DataObjectId, QueuedObject>>,
}

impl DataObjectsQueue {
    /// Empty queue over the given directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Directory the queue tracks.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record an object by statting its file in the queue directory.
    pub async fn add(&self, id: DataObjectId) -> ArchiveResult<()> {
        let path = self.object_path(id);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|source| ArchiveError::io("queue.stat", &path, source))?;
        let queued_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or_else(|_| SystemTime::now());
        self.lock().insert(
            id,
            QueuedObject {
                size: metadata.len(),
                queued_at,
            },
        );
        Ok(())
    }

    /// Whether the object is currently queued.
    #[must_use]
    pub fn has(&self, id: DataObjectId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Drop an object from the ledger, if present.
    pub fn remove(&self, id: DataObjectId) {
        self.lock().remove(&id);
    }

    /// Path of an object's file inside the queue directory.
    #[must_use]
    pub fn object_path(&self, id: DataObjectId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Current trigger-evaluation snapshot.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let entries = self.lock();
        let total_size = entries.values().map(|entry| entry.size).sum();
        let oldest_age_minutes = entries
            .values()
            .map(|entry| entry.queued_at)
            .min()
            .and_then(|queued_at| SystemTime::now().duration_since(queued_at).ok())
            .map_or(0, |age| age.as_secs() / 60);
        QueueStats {
            objects_count: entries.len(),
            total_size,
            oldest_age_minutes,
        }
    }

    /// Pop queued objects in ascending id order until their combined size
    /// reaches `limit` or the queue is exhausted. Popped entries are removed.
    #[must_use]
    pub fn pop_until_size_limit(&self, limit: u64) -> Vec<DataObjectId> {
        let mut entries = self.lock();
        let mut batch = Vec::new();
        let mut total = 0u64;
        while total < limit {
            let Some((&id, _)) = entries.first_key_value() else {
                break;
            };
            let Some(entry) = entries.remove(&id) else {
                break;
            };
            total += entry.size;
            batch.push(id);
        }
        batch
    }

    /// Partition the entire queue into size-bounded batches.
    #[must_use]
    pub fn empty_into_batches(&self, limit: u64) -> Vec<Vec<DataObjectId>> {
        let mut batches = Vec::new();
        loop {
            let batch = self.pop_until_size_limit(limit);
            if batch.is_empty() {
                return batches;
            }
            debug!(batch = batches.len(), objects = batch.len(), "queue batch drained");
            batches.push(batch);
        }
    }
}

impl DataObjectsQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<DataObjectId, QueuedObject>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Disjunction of the three compression/upload triggers.
#[derive(Debug, Clone)]
pub struct UploadThresholds {
    /// Combined queued size, in bytes, that triggers an upload.
    pub size: u64,
    /// Queued object count that triggers an upload, when configured.
    pub count: Option<usize>,
    /// Oldest queued object age, in minutes, that triggers an upload.
    pub age_minutes: u64,
}

impl UploadThresholds {
    /// Whether any trigger has fired for the given queue snapshot.
    #[must_use]
    pub fn reached(&self, stats: &QueueStats) -> bool {
        if stats.total_size >= self.size {
            return true;
        }
        if let Some(count) = self.count {
            if stats.objects_count >= count {
                return true;
            }
        }
        stats.oldest_age_minutes >= self.age_minutes
    }
}
