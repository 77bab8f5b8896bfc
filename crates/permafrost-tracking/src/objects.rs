//! Tracked data object ids with durable, crash-safe untracking.

use std::collections::HashSet;
use std::path::Path;

use permafrost_model::DataObjectId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TrackingResult;
use crate::trackfile::{EntryCodec, LockRetryPolicy, TrackfileStore};

/// File name of the object trackfile inside the upload queue directory.
pub const OBJECTS_TRACKING_FILENAME: &str = "objects_trackfile";

const TOMBSTONE_MARKER: &str = "D";

#[derive(Debug, Clone, Copy)]
struct ObjectLine {
    id: DataObjectId,
    tombstone: bool,
}

struct ObjectLineCodec;

impl EntryCodec for ObjectLineCodec {
    type Entry = ObjectLine;

    fn encode(entry: &Self::Entry) -> Result<String, String> {
        if entry.tombstone {
            Ok(format!("{} {TOMBSTONE_MARKER}", entry.id))
        } else {
            Ok(entry.id.to_string())
        }
    }

    fn decode(line: &str) -> Result<Self::Entry, String> {
        let mut parts = line.split_whitespace();
        let raw_id = parts.next().ok_or_else(|| "empty line".to_string())?;
        let id: DataObjectId = raw_id
            .parse()
            .map_err(|_| format!("invalid object id: {raw_id}"))?;
        match parts.next() {
            None => Ok(ObjectLine {
                id,
                tombstone: false,
            }),
            Some(TOMBSTONE_MARKER) if parts.next().is_none() => Ok(ObjectLine {
                id,
                tombstone: true,
            }),
            Some(other) => Err(format!("unexpected trailer: {other}")),
        }
    }
}

/// Append-only record of data object ids that have been durably handled.
///
/// Entries are either present (tracked) or tombstoned (`<id> D`); deletion is
/// itself a durable, crash-safe fact. Loading defragments the log by
/// rewriting it with only live ids.
pub struct ObjectTrackingStore {
    store: TrackfileStore<ObjectLineCodec>,
    tracked: Mutex<HashSet<DataObjectId>>,
}

impl ObjectTrackingStore {
    /// Create a store over `<dir>/objects_trackfile`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            store: TrackfileStore::new(
                dir.join(OBJECTS_TRACKING_FILENAME),
                LockRetryPolicy::default(),
            ),
            tracked: Mutex::new(HashSet::new()),
        }
    }

    /// Path of the underlying trackfile.
    #[must_use]
    pub fn trackfile_path(&self) -> &Path {
        self.store.path()
    }

    /// Create the trackfile if absent, then load it.
    pub async fn init(&self) -> TrackingResult<()> {
        self.store.init().await?;
        self.load().await
    }

    /// Reload the tracked set from disk, defragmenting the log.
    ///
    /// Tombstoned ids are dropped and the log is atomically rewritten with
    /// only live ids, bounding growth across restarts.
    pub async fn load(&self) -> TrackingResult<()> {
        let mut tracked = self.tracked.lock().await;
        let live = self
            .store
            .load_compacted(|entries| {
                let mut set = HashSet::new();
                for entry in entries {
                    if entry.tombstone {
                        set.remove(&entry.id);
                    } else {
                        set.insert(entry.id);
                    }
                }
                let mut live: Vec<ObjectLine> = set
                    .into_iter()
                    .map(|id| ObjectLine {
                        id,
                        tombstone: false,
                    })
                    .collect();
                live.sort_by_key(|entry| entry.id);
                live
            })
            .await?;
        *tracked = live.into_iter().map(|entry| entry.id).collect();
        debug!(tracked = tracked.len(), "object trackfile loaded");
        Ok(())
    }

    /// Record an id as durably handled. Idempotent.
    pub async fn track(&self, id: DataObjectId) -> TrackingResult<()> {
        let mut tracked = self.tracked.lock().await;
        if tracked.contains(&id) {
            return Ok(());
        }
        self.store
            .append(&ObjectLine {
                id,
                tombstone: false,
            })
            .await?;
        tracked.insert(id);
        Ok(())
    }

    /// Record that an id is no longer handled, appending a tombstone.
    pub async fn untrack(&self, id: DataObjectId) -> TrackingResult<()> {
        let mut tracked = self.tracked.lock().await;
        if !tracked.contains(&id) {
            return Ok(());
        }
        self.store
            .append(&ObjectLine {
                id,
                tombstone: true,
            })
            .await?;
        tracked.remove(&id);
        Ok(())
    }

    /// Whether an id is currently tracked.
    pub async fn is_tracked(&self, id: DataObjectId) -> bool {
        self.tracked.lock().await.contains(&id)
    }

    /// Snapshot of the currently tracked ids.
    pub async fn tracked_ids(&self) -> HashSet<DataObjectId> {
        self.tracked.lock().await.clone()
    }

    /// Number of currently tracked ids.
    pub async fn tracked_count(&self) -> usize {
        self.tracked.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tempdir() -> tempfile::TempDir {
        tempfile::Builder::new()
            .prefix("permafrost-objects-")
            .tempdir()
            .expect("tempdir")
    }

    #[tokio::test]
    async fn tracking_is_idempotent_on_disk_and_in_memory() {
        let dir = tempdir();
        let store = ObjectTrackingStore::new(dir.path());
        store.init().await.expect("init");

        store.track(DataObjectId::new(7)).await.expect("track");
        store.track(DataObjectId::new(7)).await.expect("track again");

        assert!(store.is_tracked(DataObjectId::new(7)).await);
        assert_eq!(store.tracked_count().await, 1);
        let raw = fs::read_to_string(store.trackfile_path()).expect("read");
        assert_eq!(raw, "7\n");
    }

    #[tokio::test]
    async fn load_defragments_tombstoned_entries() {
        let dir = tempdir();
        let path = dir.path().join(OBJECTS_TRACKING_FILENAME);
        fs::write(&path, "1\n2\n1 D\n").expect("seed trackfile");

        let store = ObjectTrackingStore::new(dir.path());
        store.init().await.expect("init");

        assert!(!store.is_tracked(DataObjectId::new(1)).await);
        assert!(store.is_tracked(DataObjectId::new(2)).await);
        let raw = fs::read_to_string(&path).expect("read");
        assert_eq!(raw, "2\n");
    }

    #[tokio::test]
    async fn untracking_survives_a_reload() {
        let dir = tempdir();
        let store = ObjectTrackingStore::new(dir.path());
        store.init().await.expect("init");
        store.track(DataObjectId::new(10)).await.expect("track");
        store.track(DataObjectId::new(11)).await.expect("track");
        store.untrack(DataObjectId::new(10)).await.expect("untrack");

        let reloaded = ObjectTrackingStore::new(dir.path());
        reloaded.init().await.expect("reload");
        assert!(!reloaded.is_tracked(DataObjectId::new(10)).await);
        assert!(reloaded.is_tracked(DataObjectId::new(11)).await);
    }

    #[tokio::test]
    async fn corrupt_lines_are_reported() {
        let dir = tempdir();
        let path = dir.path().join(OBJECTS_TRACKING_FILENAME);
        fs::write(&path, "1\nnot-an-id\n").expect("seed trackfile");

        let store = ObjectTrackingStore::new(dir.path());
        let err = store.init().await.expect_err("corrupt entry");
        assert!(matches!(
            err,
            crate::TrackingError::CorruptEntry { line_number: 2, .. }
        ));
    }
}
