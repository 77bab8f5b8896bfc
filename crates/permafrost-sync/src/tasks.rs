//! Concrete task kinds executed by the sync worker pool.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use permafrost_model::DataObjectId;
use permafrost_remote::PeerClient;
use permafrost_tasks::Task;
use permafrost_tracking::ObjectTrackingStore;
use rand::seq::SliceRandom;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::error::SyncError;

/// Terminal outcome of a download task, delivered over a channel so the
/// orchestrator can maintain queue accounting without polling the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The object landed in the upload queue directory.
    Succeeded {
        /// Downloaded object.
        id: DataObjectId,
        /// Object size in bytes, as declared by the obligations source.
        size: u64,
    },
    /// Every candidate peer failed; the object stays untracked until the
    /// next sync pass.
    Failed {
        /// Object that could not be fetched.
        id: DataObjectId,
        /// Object size in bytes, as declared by the obligations source.
        size: u64,
    },
}

/// Download one object from any peer currently holding it.
///
/// Candidates are shuffled and tried one at a time. Each attempt streams to
/// a temp file in the scratch directory and only a hash-verified download is
/// moved into the upload queue directory, so a partially written object can
/// never be observed under its final name.
pub struct DownloadFileTask {
    id: DataObjectId,
    size: u64,
    expected_hash: String,
    candidate_urls: Vec<String>,
    tmp_dir: PathBuf,
    dest_dir: PathBuf,
    client: PeerClient,
    events: UnboundedSender<DownloadOutcome>,
}

impl DownloadFileTask {
    /// Build a download task for one object.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: DataObjectId,
        size: u64,
        expected_hash: String,
        candidate_urls: Vec<String>,
        tmp_dir: PathBuf,
        dest_dir: PathBuf,
        client: PeerClient,
        events: UnboundedSender<DownloadOutcome>,
    ) -> Self {
        Self {
            id,
            size,
            expected_hash,
            candidate_urls,
            tmp_dir,
            dest_dir,
            client,
            events,
        }
    }

    async fn run(self) -> anyhow::Result<()> {
        let tmp_path = self.tmp_dir.join(format!("{}.tmp", self.id));
        let dest_path = self.dest_dir.join(self.id.to_string());

        let mut urls = self.candidate_urls;
        urls.shuffle(&mut rand::rng());
        let attempts = urls.len();

        for url in &urls {
            match self
                .client
                .download_object(url, self.id, &tmp_path, &self.expected_hash)
                .await
            {
                Ok(bytes) => {
                    if let Err(err) = tokio::fs::rename(&tmp_path, &dest_path).await {
                        remove_if_present(&tmp_path).await;
                        let _ = self.events.send(DownloadOutcome::Failed {
                            id: self.id,
                            size: self.size,
                        });
                        return Err(SyncError::io("download.finalize", dest_path, err).into());
                    }
                    debug!(object_id = %self.id, bytes, source = %url, "object downloaded");
                    let _ = self.events.send(DownloadOutcome::Succeeded {
                        id: self.id,
                        size: self.size,
                    });
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        object_id = %self.id,
                        source = %url,
                        error = %err,
                        "download attempt failed, trying next candidate"
                    );
                    remove_if_present(&tmp_path).await;
                }
            }
        }

        let _ = self.events.send(DownloadOutcome::Failed {
            id: self.id,
            size: self.size,
        });
        Err(SyncError::DownloadExhausted {
            id: self.id,
            attempts,
        }
        .into())
    }
}

/// Remove one local object: durable untrack first, then the file itself.
///
/// The tombstone is written before the unlink so a crash in between leaves
/// an orphan file that the next integrity check removes, never a tracked id
/// without a file.
pub struct DeleteLocalFileTask {
    id: DataObjectId,
    dir: PathBuf,
    tracking: Arc<ObjectTrackingStore>,
}

impl DeleteLocalFileTask {
    /// Build a deletion task for one object in `dir`.
    #[must_use]
    pub fn new(id: DataObjectId, dir: PathBuf, tracking: Arc<ObjectTrackingStore>) -> Self {
        Self { id, dir, tracking }
    }

    async fn run(self) -> anyhow::Result<()> {
        self.tracking.untrack(self.id).await?;
        let path = self.dir.join(self.id.to_string());
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(object_id = %self.id, "local object removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SyncError::io("delete.remove", path, err).into()),
        }
    }
}

async fn remove_if_present(path: &std::path::Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove temp file");
        }
    }
}

/// Tagged union of the tasks the sync worker pool executes.
pub enum SyncTask {
    /// Fetch an object from a peer.
    Download(DownloadFileTask),
    /// Remove an object that is no longer owed.
    DeleteLocal(DeleteLocalFileTask),
}

#[async_trait]
impl Task for SyncTask {
    fn description(&self) -> String {
        match self {
            Self::Download(task) => format!("download object {}", task.id),
            Self::DeleteLocal(task) => format!("delete local object {}", task.id),
        }
    }

    async fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::Download(task) => task.run().await,
            Self::DeleteLocal(task) => task.run().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Path as RoutePath;
    use axum::http::StatusCode;
    use axum::routing::get;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const PAYLOAD: &[u8] = b"sync task payload";

    async fn serve_object(serving: bool) -> String {
        let app = Router::new().route(
            "/files/{id}",
            get(move |RoutePath(_id): RoutePath<String>| async move {
                if serving {
                    Ok(PAYLOAD.to_vec())
                } else {
                    Err(StatusCode::NOT_FOUND)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn client() -> PeerClient {
        PeerClient::new(Duration::from_secs(5), Duration::from_secs(1)).expect("client")
    }

    fn dirs() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::Builder::new()
            .prefix("permafrost-sync-tasks-")
            .tempdir()
            .expect("tempdir");
        let tmp = root.path().join("tmp");
        let dest = root.path().join("uploads");
        std::fs::create_dir_all(&tmp).expect("tmp dir");
        std::fs::create_dir_all(&dest).expect("dest dir");
        (root, tmp, dest)
    }

    #[tokio::test]
    async fn download_moves_verified_object_into_place() {
        let base = serve_object(true).await;
        let (_root, tmp, dest) = dirs();
        let (events, mut outcomes) = mpsc::unbounded_channel();

        let task = DownloadFileTask::new(
            DataObjectId::new(5),
            PAYLOAD.len() as u64,
            hex::encode(Sha256::digest(PAYLOAD)),
            vec![base],
            tmp.clone(),
            dest.clone(),
            client(),
            events,
        );
        SyncTask::Download(task).execute().await.expect("download");

        assert_eq!(std::fs::read(dest.join("5")).expect("read"), PAYLOAD);
        assert!(!tmp.join("5.tmp").exists());
        assert_eq!(
            outcomes.recv().await,
            Some(DownloadOutcome::Succeeded {
                id: DataObjectId::new(5),
                size: PAYLOAD.len() as u64,
            })
        );
    }

    #[tokio::test]
    async fn exhausted_candidates_fail_and_leave_no_temp_file() {
        let bad_hash = serve_object(true).await;
        let missing = serve_object(false).await;
        let (_root, tmp, dest) = dirs();
        let (events, mut outcomes) = mpsc::unbounded_channel();

        let task = DownloadFileTask::new(
            DataObjectId::new(9),
            PAYLOAD.len() as u64,
            "deadbeef".to_string(),
            vec![bad_hash, missing],
            tmp.clone(),
            dest.clone(),
            client(),
            events,
        );
        let err = SyncTask::Download(task)
            .execute()
            .await
            .expect_err("exhaustion");
        assert!(err.to_string().contains("exhausted"));

        assert!(!dest.join("9").exists());
        assert!(!tmp.join("9.tmp").exists());
        assert_eq!(
            outcomes.recv().await,
            Some(DownloadOutcome::Failed {
                id: DataObjectId::new(9),
                size: PAYLOAD.len() as u64,
            })
        );
    }

    #[tokio::test]
    async fn delete_untracks_before_removing_the_file() {
        let (_root, _tmp, dest) = dirs();
        let tracking = Arc::new(ObjectTrackingStore::new(&dest));
        tracking.init().await.expect("init");
        tracking.track(DataObjectId::new(3)).await.expect("track");
        permafrost_test_support::write_object_file(&dest, DataObjectId::new(3), b"bytes");

        let task = DeleteLocalFileTask::new(DataObjectId::new(3), dest.clone(), tracking.clone());
        SyncTask::DeleteLocal(task).execute().await.expect("delete");

        assert!(!tracking.is_tracked(DataObjectId::new(3)).await);
        assert!(!dest.join("3").exists());
    }

    #[tokio::test]
    async fn deleting_a_missing_file_still_succeeds() {
        let (_root, _tmp, dest) = dirs();
        let tracking = Arc::new(ObjectTrackingStore::new(&dest));
        tracking.init().await.expect("init");

        let task = DeleteLocalFileTask::new(DataObjectId::new(4), dest, tracking);
        SyncTask::DeleteLocal(task).execute().await.expect("delete");
    }
}
