//! Compression and upload tasks executed by the upload worker pool.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use permafrost_model::{ArchiveManifest, DataObjectId};
use permafrost_remote::{BlobStore, Compressor, StorageClass};
use permafrost_tasks::Task;
use permafrost_tracking::{ArchivesTrackingStore, ObjectTrackingStore};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, ArchiveResult};

/// Archive key stem for a member set: the hash of the sorted id list.
///
/// Deterministic, so a crashed-and-rebuilt batch produces the same remote
/// key and uploads stay idempotent.
#[must_use]
pub fn archive_stem(ids: &[DataObjectId]) -> String {
    let mut sorted: Vec<DataObjectId> = ids.to_vec();
    sorted.sort_unstable();
    let joined = sorted
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// Shared collaborators of the archival tasks.
#[derive(Clone)]
pub struct ArchivePipeline {
    /// Durable queue directory holding objects and finished archives.
    pub upload_queue_dir: PathBuf,
    /// Object trackfile, untracked as members enter an archive.
    pub tracking: Arc<ObjectTrackingStore>,
    /// Archive trackfile, appended once an upload is confirmed.
    pub archives: Arc<ArchivesTrackingStore>,
    /// Remote destination of finished archives.
    pub store: Arc<dyn BlobStore>,
    /// Archive builder.
    pub compressor: Arc<dyn Compressor>,
    /// Compression level passed through to the compressor.
    pub compression_level: Option<u32>,
}

/// Compress a batch of objects and upload the resulting archive.
///
/// Stages, in order: build the archive under a `.tmp.` name, rename it to
/// its final name, drop the member files and their tracking entries, upload,
/// record the manifest, delete the local archive. A crash after the rename
/// leaves a completed-but-unconfirmed archive that the next integrity check
/// re-schedules for upload.
pub struct CompressAndUploadTask {
    ids: Vec<DataObjectId>,
    pipeline: ArchivePipeline,
}

impl CompressAndUploadTask {
    /// Task archiving the given batch.
    #[must_use]
    pub fn new(ids: Vec<DataObjectId>, pipeline: ArchivePipeline) -> Self {
        Self { ids, pipeline }
    }

    async fn run(self) -> ArchiveResult<()> {
        let Self { mut ids, pipeline } = self;
        ids.sort_unstable();

        let stem = archive_stem(&ids);
        let ext = pipeline.compressor.extension();
        let name = format!("{stem}.{ext}");
        let tmp_path = pipeline.upload_queue_dir.join(format!("{stem}.tmp.{ext}"));
        let final_path = pipeline.upload_queue_dir.join(&name);

        let members: Vec<PathBuf> = ids
            .iter()
            .map(|id| pipeline.upload_queue_dir.join(id.to_string()))
            .collect();
        pipeline
            .compressor
            .compress_files(&members, &tmp_path, pipeline.compression_level)
            .await
            .map_err(|source| ArchiveError::remote("archive.compress", source))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|source| ArchiveError::io("archive.finalize", &final_path, source))?;
        info!(archive = %name, members = ids.len(), "archive built");

        // The members now live inside the archive; drop the loose copies.
        for (id, path) in ids.iter().zip(&members) {
            pipeline.tracking.untrack(*id).await?;
            remove_file_if_present(path).await;
        }

        upload_and_confirm(&pipeline, &final_path, name, ids).await
    }
}

/// Upload an already-built archive found on disk.
///
/// Used by the integrity check to recover archives whose upload was not
/// confirmed before a crash. Member ids are recovered from the archive's
/// own file listing.
pub struct UploadArchiveTask {
    path: PathBuf,
    name: String,
    pipeline: ArchivePipeline,
}

impl UploadArchiveTask {
    /// Task re-uploading the archive at `path` under key `name`.
    #[must_use]
    pub fn new(path: PathBuf, name: String, pipeline: ArchivePipeline) -> Self {
        Self {
            path,
            name,
            pipeline,
        }
    }

    async fn run(self) -> ArchiveResult<()> {
        let members = self
            .pipeline
            .compressor
            .list_files(&self.path)
            .await
            .map_err(|source| ArchiveError::remote("archive.list", source))?;
        let mut ids = Vec::with_capacity(members.len());
        for member in members {
            let id: DataObjectId =
                member
                    .parse()
                    .map_err(|_| ArchiveError::InvalidArchiveMember {
                        archive: self.name.clone(),
                        member,
                    })?;
            ids.push(id);
        }
        ids.sort_unstable();
        upload_and_confirm(&self.pipeline, &self.path, self.name, ids).await
    }
}

async fn upload_and_confirm(
    pipeline: &ArchivePipeline,
    path: &std::path::Path,
    name: String,
    ids: Vec<DataObjectId>,
) -> ArchiveResult<()> {
    pipeline
        .store
        .upload_file(&name, path, Some(StorageClass::DeepArchive))
        .await
        .map_err(|source| ArchiveError::remote("archive.upload", source))?;
    pipeline
        .archives
        .track(ArchiveManifest {
            name: name.clone(),
            data_object_ids: ids,
        })
        .await?;
    remove_file_if_present(path).await;
    info!(archive = %name, "archive upload confirmed");
    Ok(())
}

async fn remove_file_if_present(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "local file removed"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove local file"),
    }
}

/// Tagged union of the tasks the upload worker pool executes.
pub enum ArchiveTask {
    /// Build an archive from a batch and upload it.
    CompressAndUpload(CompressAndUploadTask),
    /// Upload a recovered, already-built archive.
    Upload(UploadArchiveTask),
}

#[async_trait]
impl Task for ArchiveTask {
    fn description(&self) -> String {
        match self {
            Self::CompressAndUpload(task) => {
                format!("compress and upload batch of {} objects", task.ids.len())
            }
            Self::Upload(task) => format!("upload archive {}", task.name),
        }
    }

    async fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::CompressAndUpload(task) => task.run().await?,
            Self::Upload(task) => task.run().await?,
        }
        Ok(())
    }
}
