//! Diffing the obligations snapshot into download work.

use std::collections::HashSet;
use std::path::PathBuf;

use permafrost_model::{BucketId, DataObjectId, DataObjectInfo, ObligationsModel};
use permafrost_remote::PeerClient;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::tasks::{DownloadFileTask, DownloadOutcome, SyncTask};

/// Local directories the synchronizer writes into.
#[derive(Debug, Clone)]
pub struct SyncDirs {
    /// Scratch directory for partial downloads only.
    pub tmp_download_dir: PathBuf,
    /// Durable queue directory downloads are finalized into.
    pub upload_queue_dir: PathBuf,
}

/// Objects the node owes but has not durably handled yet, newest first.
///
/// The descending sort pairs with feeding the tasks into a LIFO stack from
/// the back of this list: the lowest ids are pushed first, so the most
/// recently created objects are dequeued first.
#[must_use]
pub fn added_objects(
    model: &ObligationsModel,
    tracked: &HashSet<DataObjectId>,
) -> Vec<DataObjectInfo> {
    let mut added: Vec<DataObjectInfo> = model
        .data_objects
        .iter()
        .filter(|object| !tracked.contains(&object.id))
        .cloned()
        .collect();
    added.sort_by(|a, b| b.id.cmp(&a.id));
    added
}

/// Peer operator URLs that could serve the object.
///
/// Derived from the buckets currently holding the owning bag, excluding the
/// node's own buckets and any URL that coincides with one of the node's own
/// endpoints, so a node never downloads from itself. Duplicates are dropped
/// while preserving first-seen order.
#[must_use]
pub fn candidate_urls(
    model: &ObligationsModel,
    object: &DataObjectInfo,
    own_buckets: &[BucketId],
    own_operator_urls: &[String],
) -> Vec<String> {
    let Some(bag) = model.bag(&object.bag_id) else {
        warn!(object_id = %object.id, bag_id = %object.bag_id, "object references an unknown bag");
        return Vec::new();
    };

    let own_urls: HashSet<String> = own_operator_urls
        .iter()
        .map(|url| normalize(url))
        .collect();

    let peer_buckets: Vec<BucketId> = bag
        .bucket_ids
        .iter()
        .filter(|id| !own_buckets.contains(id))
        .cloned()
        .collect();

    let mut seen = HashSet::new();
    model
        .operator_urls(&peer_buckets)
        .into_iter()
        .map(|url| normalize(&url))
        .filter(|url| !own_urls.contains(url))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn normalize(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Wrap one object and its candidate peers into a download task.
#[must_use]
pub fn build_download_task(
    object: &DataObjectInfo,
    candidates: Vec<String>,
    dirs: &SyncDirs,
    client: &PeerClient,
    events: &UnboundedSender<DownloadOutcome>,
) -> SyncTask {
    SyncTask::Download(DownloadFileTask::new(
        object.id,
        object.size,
        object.content_hash.clone(),
        candidates,
        dirs.tmp_download_dir.clone(),
        dirs.upload_queue_dir.clone(),
        client.clone(),
        events.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use permafrost_model::{Bag, BagId, StorageBucket};

    fn object(id: u64, bag: &str) -> DataObjectInfo {
        DataObjectInfo {
            id: DataObjectId::new(id),
            size: 64,
            content_hash: "00".repeat(32),
            bag_id: BagId::new(bag),
        }
    }

    fn bucket(id: &str, url: Option<&str>) -> StorageBucket {
        StorageBucket {
            id: BucketId::new(id),
            operator_url: url.map(str::to_string),
        }
    }

    #[test]
    fn added_objects_exclude_tracked_and_sort_newest_first() {
        let model = ObligationsModel {
            data_objects: vec![object(3, "bag:1"), object(9, "bag:1"), object(5, "bag:1")],
            bags: vec![],
            storage_buckets: vec![],
        };
        let tracked: HashSet<DataObjectId> = [DataObjectId::new(5)].into_iter().collect();

        let added = added_objects(&model, &tracked);
        let ids: Vec<u64> = added.iter().map(|o| o.id.value()).collect();
        assert_eq!(ids, vec![9, 3]);
    }

    #[test]
    fn candidates_exclude_own_buckets_and_own_urls() {
        let model = ObligationsModel {
            data_objects: vec![object(1, "bag:1")],
            bags: vec![Bag {
                id: BagId::new("bag:1"),
                bucket_ids: vec![
                    BucketId::new("1"),
                    BucketId::new("2"),
                    BucketId::new("3"),
                    BucketId::new("4"),
                ],
            }],
            storage_buckets: vec![
                bucket("1", Some("http://self.example")),
                bucket("2", Some("http://peer-a.example/")),
                bucket("3", Some("http://mirror-of-self.example")),
                bucket("4", Some("http://peer-a.example")),
            ],
        };

        let urls = candidate_urls(
            &model,
            &model.data_objects[0],
            &[BucketId::new("1")],
            &["http://mirror-of-self.example/".to_string()],
        );
        assert_eq!(urls, vec!["http://peer-a.example".to_string()]);
    }

    #[test]
    fn unknown_bag_yields_no_candidates() {
        let model = ObligationsModel {
            data_objects: vec![object(1, "bag:missing")],
            bags: vec![],
            storage_buckets: vec![],
        };
        assert!(candidate_urls(&model, &model.data_objects[0], &[], &[]).is_empty());
    }
}
