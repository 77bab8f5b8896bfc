//! Tracked archive manifests (JSON per line, append-only).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use permafrost_model::{ArchiveManifest, DataObjectId};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TrackingResult;
use crate::trackfile::{EntryCodec, LockRetryPolicy, TrackfileStore};

/// File name of the archives trackfile inside the upload queue directory.
pub const ARCHIVES_TRACKING_FILENAME: &str = "archives_trackfile.jsonl";

struct ArchiveLineCodec;

impl EntryCodec for ArchiveLineCodec {
    type Entry = ArchiveManifest;

    fn encode(entry: &Self::Entry) -> Result<String, String> {
        serde_json::to_string(entry).map_err(|err| err.to_string())
    }

    fn decode(line: &str) -> Result<Self::Entry, String> {
        serde_json::from_str(line).map_err(|err| err.to_string())
    }
}

/// Which archives contain which of a requested set of object ids.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ObjectSearch {
    /// Archive name to the requested ids it contains.
    pub archives: BTreeMap<String, Vec<DataObjectId>>,
    /// Requested ids found in no tracked archive.
    pub missing: Vec<DataObjectId>,
}

/// Durable record of archives that have been built and confirmed uploaded.
///
/// Manifests are written once and never mutated; the in-memory index is keyed
/// by archive name.
pub struct ArchivesTrackingStore {
    store: TrackfileStore<ArchiveLineCodec>,
    tracked: Mutex<HashMap<String, ArchiveManifest>>,
}

impl ArchivesTrackingStore {
    /// Create a store over `<dir>/archives_trackfile.jsonl`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            store: TrackfileStore::new(
                dir.join(ARCHIVES_TRACKING_FILENAME),
                LockRetryPolicy::default(),
            ),
            tracked: Mutex::new(HashMap::new()),
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

    /// Reload the manifest index from disk.
    pub async fn load(&self) -> TrackingResult<()> {
        let mut tracked = self.tracked.lock().await;
        let entries = self.store.load().await?;
        *tracked = entries
            .into_iter()
            .map(|manifest| (manifest.name.clone(), manifest))
            .collect();
        debug!(archives = tracked.len(), "archives trackfile loaded");
        Ok(())
    }

    /// Record an archive as built and confirmed uploaded. Idempotent by name.
    pub async fn track(&self, manifest: ArchiveManifest) -> TrackingResult<()> {
        let mut tracked = self.tracked.lock().await;
        if tracked.contains_key(&manifest.name) {
            return Ok(());
        }
        self.store.append(&manifest).await?;
        tracked.insert(manifest.name.clone(), manifest);
        Ok(())
    }

    /// Whether an archive name has been confirmed uploaded.
    pub async fn is_tracked(&self, name: &str) -> bool {
        self.tracked.lock().await.contains_key(name)
    }

    /// Number of tracked archives.
    pub async fn tracked_count(&self) -> usize {
        self.tracked.lock().await.len()
    }

    /// Report which tracked archives contain which of the requested ids, and
    /// which requested ids appear in none.
    ///
    /// Operational tooling only; not used on the hot path.
    pub async fn find_data_objects(&self, ids: &[DataObjectId]) -> ObjectSearch {
        let tracked = self.tracked.lock().await;
        let mut search = ObjectSearch::default();
        for &id in ids {
            let mut found = false;
            for manifest in tracked.values() {
                if manifest.data_object_ids.contains(&id) {
                    search
                        .archives
                        .entry(manifest.name.clone())
                        .or_default()
                        .push(id);
                    found = true;
                }
            }
            if !found {
                search.missing.push(id);
            }
        }
        search
    }
}
