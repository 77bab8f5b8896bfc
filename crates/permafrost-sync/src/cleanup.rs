//! Replication-gated pruning of objects the node no longer owes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream;
use permafrost_model::{BucketId, DataObjectId};
use permafrost_remote::{ObjectLocations, ObligationsSource, PeerClient};
use permafrost_tasks::{TaskProcessorSpawner, WorkingStack};
use permafrost_tracking::ObjectTrackingStore;
use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use crate::tasks::{DeleteLocalFileTask, SyncTask};

/// Tunables of one cleanup pass.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Minimum number of peers that must confirm holding a moved object
    /// before its local copy is dropped.
    pub replication_threshold: usize,
    /// Maximum tolerated obligations-source lag, in blocks. A pass refuses
    /// to run above this.
    pub max_processing_lag: u64,
    /// Concurrent existence probes per pass.
    pub probe_concurrency: usize,
    /// Deletion worker pool size.
    pub workers: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            replication_threshold: 2,
            max_processing_lag: 100,
            probe_concurrency: 20,
            workers: 20,
        }
    }
}

/// Counts reported after a completed cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Locally stored ids no longer assigned to this node.
    pub obsolete: usize,
    /// Ids confirmed deleted system-wide and removed immediately.
    pub deleted: usize,
    /// Moved ids removed after the replication threshold was met.
    pub pruned: usize,
    /// Moved ids kept because replication could not be confirmed.
    pub skipped: usize,
}

/// Prunes local objects that are no longer owed, one pass at a time.
///
/// A pass is gated on the obligations source being reasonably fresh;
/// pruning against stale state could drop the only surviving replica.
pub struct CleanupService {
    obligations: Arc<dyn ObligationsSource>,
    peer: PeerClient,
    tracking: Arc<ObjectTrackingStore>,
    upload_queue_dir: PathBuf,
    own_buckets: Vec<BucketId>,
    config: CleanupConfig,
}

impl CleanupService {
    /// Build a cleanup service over the node's upload queue directory.
    #[must_use]
    pub fn new(
        obligations: Arc<dyn ObligationsSource>,
        peer: PeerClient,
        tracking: Arc<ObjectTrackingStore>,
        upload_queue_dir: PathBuf,
        own_buckets: Vec<BucketId>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            obligations,
            peer,
            tracking,
            upload_queue_dir,
            own_buckets,
            config,
        }
    }

    /// Run one cleanup pass.
    ///
    /// # Errors
    ///
    /// Fails closed with [`SyncError::StaleObligations`] when the source lags
    /// beyond the configured threshold, and propagates remote failures from
    /// the obligations queries. Individual deletions failing is not an error
    /// for the pass; they are logged and retried next time.
    pub async fn run_pass(&self) -> SyncResult<CleanupSummary> {
        let lag = self
            .obligations
            .processing_lag()
            .await
            .map_err(|source| SyncError::remote("cleanup.lag", source))?;
        if lag > self.config.max_processing_lag {
            return Err(SyncError::StaleObligations {
                lag,
                threshold: self.config.max_processing_lag,
            });
        }

        let model = self
            .obligations
            .fetch(&self.own_buckets)
            .await
            .map_err(|source| SyncError::remote("cleanup.fetch", source))?;
        let assigned: HashSet<DataObjectId> =
            model.data_objects.iter().map(|object| object.id).collect();

        let mut obsolete: Vec<DataObjectId> = self
            .tracking
            .tracked_ids()
            .await
            .into_iter()
            .filter(|id| !assigned.contains(id))
            .collect();
        obsolete.sort_unstable();
        if obsolete.is_empty() {
            return Ok(CleanupSummary::default());
        }
        info!(obsolete = obsolete.len(), "cleanup pass found obsolete objects");

        let deleted: HashSet<DataObjectId> = self
            .obligations
            .deleted_object_ids(&obsolete)
            .await
            .map_err(|source| SyncError::remote("cleanup.deleted", source))?
            .into_iter()
            .collect();
        let moved: Vec<DataObjectId> = obsolete
            .iter()
            .copied()
            .filter(|id| !deleted.contains(id))
            .collect();

        let mut removable: Vec<DataObjectId> = deleted.iter().copied().collect();
        removable.sort_unstable();
        let mut skipped = 0usize;
        let mut pruned = 0usize;

        if !moved.is_empty() {
            let locations = self
                .obligations
                .object_locations(&moved)
                .await
                .map_err(|source| SyncError::remote("cleanup.locations", source))?;
            for location in &locations {
                let replicas = self.count_replicas(location).await;
                if replicas >= self.config.replication_threshold {
                    removable.push(location.id);
                    pruned += 1;
                } else {
                    warn!(
                        object_id = %location.id,
                        replicas,
                        required = self.config.replication_threshold,
                        "insufficient replication, keeping local copy"
                    );
                    skipped += 1;
                }
            }
            // Moved ids without a known holder cannot be confirmed either.
            let located: HashSet<DataObjectId> =
                locations.iter().map(|location| location.id).collect();
            skipped += moved.iter().filter(|id| !located.contains(id)).count();
        }

        let summary = CleanupSummary {
            obsolete: obsolete.len(),
            deleted: deleted.len(),
            pruned,
            skipped,
        };

        if !removable.is_empty() {
            let stack: WorkingStack<SyncTask> = WorkingStack::new();
            stack.add(
                removable
                    .into_iter()
                    .map(|id| {
                        SyncTask::DeleteLocal(DeleteLocalFileTask::new(
                            id,
                            self.upload_queue_dir.clone(),
                            Arc::clone(&self.tracking),
                        ))
                    })
                    .collect(),
            );
            TaskProcessorSpawner::new(stack, self.config.workers, true)
                .process()
                .await;
        }

        info!(
            obsolete = summary.obsolete,
            deleted = summary.deleted,
            pruned = summary.pruned,
            skipped = summary.skipped,
            "cleanup pass finished"
        );
        Ok(summary)
    }

    /// Probe the object's current holders, counting successful responses.
    /// Probe failures count as "not holding".
    async fn count_replicas(&self, location: &ObjectLocations) -> usize {
        stream::iter(location.operator_urls.iter())
            .map(|url| {
                let peer = self.peer.clone();
                let id = location.id;
                async move { peer.probe_object(url, id).await.unwrap_or(false) }
            })
            .buffer_unordered(self.config.probe_concurrency.max(1))
            .filter(|held| futures_util::future::ready(*held))
            .count()
            .await
    }
}
