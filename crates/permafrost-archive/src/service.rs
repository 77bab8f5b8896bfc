//! The archival orchestrator and its four-stage processing loop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use permafrost_model::{BucketId, DataObjectId};
use permafrost_remote::{
    BlobStore, Compressor, ObligationsSource, PeerClient, StorageClass,
};
use permafrost_sync::{
    DownloadOutcome, SyncDirs, added_objects, build_download_task, candidate_urls,
};
use permafrost_tasks::{TaskProcessorSpawner, WorkingStack};
use permafrost_tracking::{
    ARCHIVES_TRACKING_FILENAME, ArchivesTrackingStore, OBJECTS_TRACKING_FILENAME,
    ObjectTrackingStore,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::error::{ArchiveError, ArchiveResult};
use crate::queue::{DataObjectsQueue, UploadThresholds};
use crate::tasks::{ArchivePipeline, ArchiveTask, CompressAndUploadTask, UploadArchiveTask};

/// Tunables of the archival orchestrator.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Durable queue directory: downloaded objects, finished archives and
    /// the trackfiles.
    pub upload_queue_dir: PathBuf,
    /// Scratch directory for partial downloads.
    pub tmp_download_dir: PathBuf,
    /// Hard cap on the upload queue directory size, in bytes. Downloads
    /// pause when queuing another object would exceed it.
    pub upload_dir_size_limit: u64,
    /// Target combined member size per archive, in bytes.
    pub archive_size_limit: u64,
    /// Compression/upload triggers.
    pub thresholds: UploadThresholds,
    /// Download worker pool size.
    pub sync_workers: usize,
    /// Compression/upload worker pool size.
    pub upload_workers: usize,
    /// Idle-stage pause between processing iterations.
    pub sync_interval: Duration,
    /// Pause before re-checking disk headroom when backpressure engages.
    pub backpressure_interval: Duration,
    /// How often the archives-trackfile backup timer fires.
    pub trackfile_backup_interval: Duration,
    /// Compression level passed through to the compressor.
    pub compression_level: Option<u32>,
    /// Buckets operated by this node.
    pub own_buckets: Vec<BucketId>,
    /// This node's own operator URLs, excluded from download candidates.
    pub own_operator_urls: Vec<String>,
}

/// Long-running archival orchestrator.
///
/// Each iteration of [`ArchiveService::run`] walks four stages: integrity
/// check, sync, remaining-uploads check, idle. Download completions arrive
/// over a channel and drive queue accounting and threshold evaluation
/// between iterations.
pub struct ArchiveService {
    config: ArchiveConfig,
    obligations: Arc<dyn ObligationsSource>,
    peer: PeerClient,
    pipeline: ArchivePipeline,
    queue: DataObjectsQueue,
    sync_stack: WorkingStack<permafrost_sync::SyncTask>,
    upload_stack: WorkingStack<ArchiveTask>,
    sync_spawner: Arc<TaskProcessorSpawner<permafrost_sync::SyncTask>>,
    upload_spawner: Arc<TaskProcessorSpawner<ArchiveTask>>,
    events_tx: UnboundedSender<DownloadOutcome>,
    events_rx: Mutex<Option<UnboundedReceiver<DownloadOutcome>>>,
    in_flight_bytes: AtomicU64,
    preparing_for_upload: AtomicBool,
    trackfile_last_mtime: Mutex<Option<SystemTime>>,
}

impl ArchiveService {
    /// Wire up the orchestrator and its collaborators.
    #[must_use]
    pub fn new(
        config: ArchiveConfig,
        obligations: Arc<dyn ObligationsSource>,
        store: Arc<dyn BlobStore>,
        compressor: Arc<dyn Compressor>,
        peer: PeerClient,
    ) -> Self {
        let tracking = Arc::new(ObjectTrackingStore::new(&config.upload_queue_dir));
        let archives = Arc::new(ArchivesTrackingStore::new(&config.upload_queue_dir));
        let pipeline = ArchivePipeline {
            upload_queue_dir: config.upload_queue_dir.clone(),
            tracking,
            archives,
            store,
            compressor,
            compression_level: config.compression_level,
        };
        let queue = DataObjectsQueue::new(&config.upload_queue_dir);
        let sync_stack = WorkingStack::new();
        let upload_stack = WorkingStack::new();
        let sync_spawner = Arc::new(TaskProcessorSpawner::new(
            sync_stack.clone(),
            config.sync_workers,
            false,
        ));
        let upload_spawner = Arc::new(TaskProcessorSpawner::new(
            upload_stack.clone(),
            config.upload_workers,
            false,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            obligations,
            peer,
            pipeline,
            queue,
            sync_stack,
            upload_stack,
            sync_spawner,
            upload_spawner,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            in_flight_bytes: AtomicU64::new(0),
            preparing_for_upload: AtomicBool::new(false),
            trackfile_last_mtime: Mutex::new(None),
        }
    }

    /// Object trackfile shared with operational tooling.
    #[must_use]
    pub fn tracking(&self) -> &Arc<ObjectTrackingStore> {
        &self.pipeline.tracking
    }

    /// Archives trackfile shared with operational tooling.
    #[must_use]
    pub fn archives(&self) -> &Arc<ArchivesTrackingStore> {
        &self.pipeline.archives
    }

    /// Initialize directories, trackfiles and the in-memory queue.
    ///
    /// Rediscovers data objects already sitting in the upload queue
    /// directory from a previous run.
    ///
    /// # Errors
    ///
    /// Fails when a directory cannot be created or a trackfile cannot be
    /// loaded. Initialization failure is fatal to the node.
    pub async fn init(&self) -> ArchiveResult<()> {
        info!("initializing archive service");
        for dir in [&self.config.upload_queue_dir, &self.config.tmp_download_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ArchiveError::io("init.create_dir", dir, source))?;
        }
        self.pipeline.tracking.init().await?;
        self.pipeline.archives.init().await?;
        self.discover_queued_objects().await?;
        info!(queued = self.queue.stats().objects_count, "archive service initialized");
        Ok(())
    }

    /// Scan the upload queue directory for data objects left over from a
    /// previous run and feed them back into the queue.
    async fn discover_queued_objects(&self) -> ArchiveResult<()> {
        let dir = &self.config.upload_queue_dir;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|source| ArchiveError::io("init.read_dir", dir, source))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| ArchiveError::io("init.read_dir", dir, source))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|source| ArchiveError::io("init.file_type", entry.path(), source))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(id) = name.parse::<DataObjectId>() {
                self.process_new_data_object(id).await;
            }
        }
        Ok(())
    }

    /// Record a fully downloaded object: durable tracking entry first, then
    /// the in-memory queue. If either step fails, the object is removed and
    /// left for the next sync pass to re-download.
    pub async fn process_new_data_object(&self, id: DataObjectId) {
        debug!(object_id = %id, "processing new data object");
        let result: ArchiveResult<()> = async {
            self.pipeline.tracking.track(id).await?;
            self.queue.add(id).await
        }
        .await;
        if let Err(err) = result {
            error!(object_id = %id, error = %err, "failed to process data object, removing it");
            self.try_removing_local_data_object(id).await;
        }
    }

    async fn try_removing_local_data_object(&self, id: DataObjectId) {
        info!(object_id = %id, "removing object");
        self.queue.remove(id);
        if let Err(err) = self.pipeline.tracking.untrack(id).await {
            error!(object_id = %id, error = %err, "failed to untrack local object");
        }
        try_removing_file(&self.queue.object_path(id)).await;
    }

    /// Resolves once no download, compression or upload work is pending.
    pub async fn no_pending_tasks(&self) {
        while !self.sync_spawner.is_idle()
            || !self.upload_spawner.is_idle()
            || self.preparing_for_upload.load(Ordering::SeqCst)
        {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Run the orchestrator forever.
    ///
    /// A worker loop returning is treated as fatal; the process exits
    /// rather than continuing in a known-bad state.
    pub async fn run(self: Arc<Self>) {
        self.spawn_event_handler();
        self.spawn_trackfile_backup_timer();
        self.spawn_processor_watchdog("sync", Arc::clone(&self.sync_spawner));
        self.spawn_processor_watchdog("upload", Arc::clone(&self.upload_spawner));

        loop {
            info!("running data integrity check");
            if let Err(err) = self.integrity_check().await {
                error!(error = %err, "data integrity check failed");
            }

            info!("started syncing");
            if let Err(err) = self.perform_sync().await {
                error!(error = %err, "sync failed");
            }
            // The first sync after a long gap can keep workers busy for a
            // very long time.
            self.no_pending_tasks().await;
            info!("sync done");

            info!("checking for uploads to prepare");
            if let Err(err) = self.upload_if_ready().await {
                error!(error = %err, "upload readiness check failed");
            }
            self.no_pending_tasks().await;
            info!("uploads check done");

            info!(
                pause_secs = self.config.sync_interval.as_secs(),
                "iteration done, pausing"
            );
            tokio::time::sleep(self.config.sync_interval).await;
        }
    }

    fn spawn_processor_watchdog<T: permafrost_tasks::Task>(
        &self,
        name: &'static str,
        spawner: Arc<TaskProcessorSpawner<T>>,
    ) {
        tokio::spawn(async move {
            spawner.process().await;
            error!(pool = name, "task processing loop returned unexpectedly");
            std::process::exit(1);
        });
    }

    fn spawn_event_handler(self: &Arc<Self>) {
        let Some(mut events) = self
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(outcome) = events.recv().await {
                handler.handle_download_outcome(outcome).await;
            }
        });
    }

    async fn handle_download_outcome(&self, outcome: DownloadOutcome) {
        match outcome {
            DownloadOutcome::Succeeded { id, size } => {
                debug!(object_id = %id, "download success event received");
                self.release_in_flight(size);
                self.process_new_data_object(id).await;
                if let Err(err) = self.upload_if_ready().await {
                    error!(error = %err, "critical failure while handling download success");
                    std::process::exit(1);
                }
            }
            DownloadOutcome::Failed { size, .. } => {
                self.release_in_flight(size);
            }
        }
    }

    fn release_in_flight(&self, size: u64) {
        let _ = self
            .in_flight_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(size))
            });
    }

    fn spawn_trackfile_backup_timer(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(service.config.trackfile_backup_interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                if let Err(err) = service.backup_archives_trackfile().await {
                    error!(error = %err, "failed to upload archives trackfile backup");
                }
            }
        });
    }

    /// Upload the archives trackfile to the blob store when its mtime has
    /// advanced since the last backup. Uses a standard storage class since
    /// the file is small, often overwritten and useful to fetch quickly.
    pub async fn backup_archives_trackfile(&self) -> ArchiveResult<()> {
        let path = self.pipeline.archives.trackfile_path();
        let modified = tokio::fs::metadata(path)
            .await
            .and_then(|metadata| metadata.modified())
            .map_err(|source| ArchiveError::io("backup.stat", path, source))?;
        {
            let last = self
                .trackfile_last_mtime
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|last| modified <= last) {
                return Ok(());
            }
        }
        info!("backing up the archives trackfile");
        self.pipeline
            .store
            .upload_file(
                ARCHIVES_TRACKING_FILENAME,
                path,
                Some(StorageClass::Standard),
            )
            .await
            .map_err(|source| ArchiveError::remote("backup.upload", source))?;
        *self
            .trackfile_last_mtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(modified);
        Ok(())
    }

    /// Combined size of the regular files in the upload queue directory.
    async fn upload_dir_size(&self) -> ArchiveResult<u64> {
        let dir = &self.config.upload_queue_dir;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|source| ArchiveError::io("sync.read_dir", dir, source))?;
        let mut total = 0u64;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| ArchiveError::io("sync.read_dir", dir, source))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|source| ArchiveError::io("sync.stat", entry.path(), source))?;
            if metadata.is_file() {
                total += metadata.len();
            }
        }
        Ok(total)
    }

    /// Sync stage: queue download tasks for every newly assigned object,
    /// pausing whenever another download would push the upload queue
    /// directory past its size limit.
    ///
    /// Does not wait for the queued downloads to finish.
    pub async fn perform_sync(&self) -> ArchiveResult<()> {
        let model = self
            .obligations
            .fetch(&self.config.own_buckets)
            .await
            .map_err(|source| ArchiveError::remote("sync.fetch", source))?;
        let tracked = self.pipeline.tracking.tracked_ids().await;
        let mut added = added_objects(&model, &tracked);
        info!(new_objects = added.len(), "sync pass computed new objects");

        let dirs = SyncDirs {
            tmp_download_dir: self.config.tmp_download_dir.clone(),
            upload_queue_dir: self.config.upload_queue_dir.clone(),
        };
        while !added.is_empty() {
            let dir_size = self.upload_dir_size().await?;
            // Lowest ids are queued first so the LIFO stack serves the
            // newest objects ahead of the backlog.
            while let Some(object) = added.pop() {
                let in_flight = self.in_flight_bytes.load(Ordering::SeqCst);
                if object.size + dir_size + in_flight > self.config.upload_dir_size_limit {
                    debug!(
                        dir_size,
                        in_flight,
                        object_size = object.size,
                        limit = self.config.upload_dir_size_limit,
                        "waiting for disk space to free up"
                    );
                    added.push(object);
                    tokio::time::sleep(self.config.backpressure_interval).await;
                    break;
                }
                let candidates = candidate_urls(
                    &model,
                    &object,
                    &self.config.own_buckets,
                    &self.config.own_operator_urls,
                );
                let task =
                    build_download_task(&object, candidates, &dirs, &self.peer, &self.events_tx);
                self.in_flight_bytes.fetch_add(object.size, Ordering::SeqCst);
                self.sync_stack.add(vec![task]);
            }
        }
        Ok(())
    }

    /// Integrity-check stage: classify every entry of the upload queue
    /// directory, removing orphans and temp files and re-scheduling
    /// completed archives whose upload was never confirmed.
    ///
    /// Assumes no tasks are currently in progress.
    pub async fn integrity_check(&self) -> ArchiveResult<()> {
        let dir = &self.config.upload_queue_dir;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|source| ArchiveError::io("integrity.read_dir", dir, source))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| ArchiveError::io("integrity.read_dir", dir, source))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|source| ArchiveError::io("integrity.file_type", entry.path(), source))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !file_type.is_file() {
                warn!(name = %name, "found unrecognized subdirectory");
                continue;
            }
            if is_trackfile_entry(&name) {
                continue;
            }
            self.classify_entry(&name).await;
        }
        Ok(())
    }

    async fn classify_entry(&self, name: &str) {
        let parts: Vec<&str> = name.split('.').collect();
        let stem = parts[0];
        let is_tmp = parts.get(1).copied() == Some("tmp");
        let ext = parts[if is_tmp { 2 } else { 1 }..].join(".");

        if !is_tmp && ext.is_empty() {
            if let Ok(id) = stem.parse::<DataObjectId>() {
                if !self.queue.has(id) {
                    error!(object_id = %id, "object found on disk but not in the upload queue, removing");
                    self.try_removing_local_data_object(id).await;
                } else if !self.pipeline.tracking.is_tracked(id).await {
                    error!(object_id = %id, "object found on disk but not tracked, removing");
                    self.try_removing_local_data_object(id).await;
                }
                return;
            }
        }
        if !is_tmp && ext == self.pipeline.compressor.extension() {
            if self.pipeline.archives.is_tracked(name).await {
                warn!(archive = %name, "found already uploaded archive, removing");
                try_removing_file(&self.config.upload_queue_dir.join(name)).await;
            } else {
                warn!(archive = %name, "found unuploaded archive, scheduling for re-upload");
                self.upload_stack.add(vec![ArchiveTask::Upload(
                    UploadArchiveTask::new(
                        self.config.upload_queue_dir.join(name),
                        name.to_string(),
                        self.pipeline.clone(),
                    ),
                )]);
            }
            return;
        }
        if is_tmp {
            warn!(name = %name, "found temporary file, removing");
            try_removing_file(&self.config.upload_queue_dir.join(name)).await;
            return;
        }
        warn!(name = %name, "found unrecognized file");
    }

    /// Remaining-uploads stage: when any threshold has fired, partition the
    /// queue into archive-sized batches and schedule one compression task
    /// per batch.
    pub async fn upload_if_ready(&self) -> ArchiveResult<()> {
        let stats = self.queue.stats();
        if !self.config.thresholds.reached(&stats) {
            return Ok(());
        }
        self.preparing_for_upload.store(true, Ordering::SeqCst);
        let batches = self.queue.empty_into_batches(self.config.archive_size_limit);
        if batches.is_empty() {
            warn!("upload triggered with no batches to prepare");
        } else {
            info!(batches = batches.len(), "preparing object batches for upload");
            let tasks: Vec<ArchiveTask> = batches
                .into_iter()
                .map(|batch| {
                    ArchiveTask::CompressAndUpload(CompressAndUploadTask::new(
                        batch,
                        self.pipeline.clone(),
                    ))
                })
                .collect();
            self.upload_stack.add(tasks);
        }
        self.preparing_for_upload.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn is_trackfile_entry(name: &str) -> bool {
    name == OBJECTS_TRACKING_FILENAME
        || name == ARCHIVES_TRACKING_FILENAME
        || name.ends_with(".lock")
}

async fn try_removing_file(path: &std::path::Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            error!(path = %path.display(), error = %err, "failed to remove local file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permafrost_model::{Bag, BagId, DataObjectInfo, ObligationsModel, StorageBucket};
    use permafrost_remote::TarCompressor;
    use permafrost_test_support::{MemoryBlobStore, StaticObligations, sha256_hex, write_object_file};
    use permafrost_tasks::TaskProcessorSpawner;

    use crate::tasks::archive_stem;

    fn config(root: &std::path::Path) -> ArchiveConfig {
        ArchiveConfig {
            upload_queue_dir: root.join("uploads"),
            tmp_download_dir: root.join("tmp"),
            upload_dir_size_limit: 1 << 30,
            archive_size_limit: 1 << 20,
            thresholds: UploadThresholds {
                size: 1 << 20,
                count: None,
                age_minutes: 24 * 60,
            },
            sync_workers: 2,
            upload_workers: 2,
            sync_interval: Duration::from_secs(60),
            backpressure_interval: Duration::from_millis(10),
            trackfile_backup_interval: Duration::from_secs(60),
            compression_level: None,
            own_buckets: vec![BucketId::new("1")],
            own_operator_urls: vec![],
        }
    }

    fn service_with(
        config: ArchiveConfig,
        obligations: StaticObligations,
    ) -> (Arc<ArchiveService>, Arc<MemoryBlobStore>) {
        let store = Arc::new(MemoryBlobStore::new());
        let peer = PeerClient::new(Duration::from_secs(5), Duration::from_secs(1)).expect("client");
        let service = Arc::new(ArchiveService::new(
            config,
            Arc::new(obligations),
            store.clone(),
            Arc::new(TarCompressor::plain()),
            peer,
        ));
        (service, store)
    }

    fn tempdir() -> tempfile::TempDir {
        tempfile::Builder::new()
            .prefix("permafrost-service-")
            .tempdir()
            .expect("tempdir")
    }

    async fn drain<T: permafrost_tasks::Task>(stack: &WorkingStack<T>, workers: usize) {
        TaskProcessorSpawner::new(stack.clone(), workers, true)
            .process()
            .await;
    }

    fn payload_model(id: u64, payload: &[u8], peer_url: Option<String>) -> ObligationsModel {
        ObligationsModel {
            data_objects: vec![DataObjectInfo {
                id: DataObjectId::new(id),
                size: payload.len() as u64,
                content_hash: sha256_hex(payload),
                bag_id: BagId::new("bag:1"),
            }],
            bags: vec![Bag {
                id: BagId::new("bag:1"),
                bucket_ids: vec![BucketId::new("1"), BucketId::new("2")],
            }],
            storage_buckets: vec![
                StorageBucket {
                    id: BucketId::new("1"),
                    operator_url: None,
                },
                StorageBucket {
                    id: BucketId::new("2"),
                    operator_url: peer_url,
                },
            ],
        }
    }

    async fn serve_payload(payload: &'static [u8]) -> String {
        use axum::Router;
        use axum::extract::Path as RoutePath;
        use axum::routing::get;
        let app = Router::new().route(
            "/files/{id}",
            get(move |RoutePath(_id): RoutePath<String>| async move { payload.to_vec() }),
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

    #[tokio::test]
    async fn init_rediscovers_leftover_objects() {
        let root = tempdir();
        let mut cfg = config(root.path());
        cfg.upload_queue_dir = root.path().to_path_buf();
        write_object_file(root.path(), DataObjectId::new(12), b"leftover");

        let (service, _store) =
            service_with(cfg, StaticObligations::new(ObligationsModel::default()));
        service.init().await.expect("init");

        assert!(service.queue.has(DataObjectId::new(12)));
        assert!(service.pipeline.tracking.is_tracked(DataObjectId::new(12)).await);
    }

    #[tokio::test]
    async fn sync_download_feeds_the_upload_pipeline() {
        const PAYLOAD: &[u8] = b"end to end object payload";
        let root = tempdir();
        let peer_url = serve_payload(PAYLOAD).await;
        let model = payload_model(42, PAYLOAD, Some(peer_url));

        let mut cfg = config(root.path());
        // Fire the size trigger as soon as the object lands.
        cfg.thresholds.size = 1;
        let (service, store) = service_with(cfg, StaticObligations::new(model));
        service.init().await.expect("init");

        service.perform_sync().await.expect("sync");
        assert_eq!(service.sync_stack.len(), 1);
        drain(&service.sync_stack, 1).await;

        // Deliver the download event the way the running service would.
        let outcome = service
            .events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .expect("receiver")
            .try_recv()
            .expect("outcome");
        service.handle_download_outcome(outcome).await;

        assert_eq!(service.in_flight_bytes.load(Ordering::SeqCst), 0);
        assert_eq!(service.upload_stack.len(), 1);
        drain(&service.upload_stack, 1).await;

        let ids = vec![DataObjectId::new(42)];
        let name = format!("{}.tar", archive_stem(&ids));
        assert!(store.contains(&name));
        assert!(service.pipeline.archives.is_tracked(&name).await);
        assert!(!service.pipeline.tracking.is_tracked(DataObjectId::new(42)).await);
        assert!(!service.config.upload_queue_dir.join("42").exists());
    }

    #[tokio::test]
    async fn integrity_check_recovers_unconfirmed_archives() {
        let root = tempdir();
        let cfg = config(root.path());
        let upload_dir = cfg.upload_queue_dir.clone();
        let (service, store) =
            service_with(cfg, StaticObligations::new(ObligationsModel::default()));
        service.init().await.expect("init");

        // Build an archive but "crash" before confirming its upload.
        let member = write_object_file(&upload_dir, DataObjectId::new(7), b"member");
        let ids = vec![DataObjectId::new(7)];
        let name = format!("{}.tar", archive_stem(&ids));
        service
            .pipeline
            .compressor
            .compress_files(&[member.clone()], &upload_dir.join(&name), None)
            .await
            .expect("compress");
        std::fs::remove_file(&member).expect("drop member");

        service.integrity_check().await.expect("check");
        assert_eq!(service.upload_stack.len(), 1);
        drain(&service.upload_stack, 1).await;

        assert!(store.contains(&name));
        assert!(service.pipeline.archives.is_tracked(&name).await);
        assert!(!upload_dir.join(&name).exists());
    }

    #[tokio::test]
    async fn integrity_check_removes_orphans_tmp_files_and_stale_archives() {
        let root = tempdir();
        let cfg = config(root.path());
        let upload_dir = cfg.upload_queue_dir.clone();
        let (service, _store) =
            service_with(cfg, StaticObligations::new(ObligationsModel::default()));
        service.init().await.expect("init");

        // Orphan object (on disk, never tracked), temp file, and an archive
        // that is already confirmed uploaded.
        write_object_file(&upload_dir, DataObjectId::new(99), b"orphan");
        std::fs::write(upload_dir.join("abc.tmp.tar"), b"partial").expect("seed");
        std::fs::write(upload_dir.join("stale.tar"), b"archive").expect("seed");
        service
            .pipeline
            .archives
            .track(permafrost_model::ArchiveManifest {
                name: "stale.tar".to_string(),
                data_object_ids: vec![DataObjectId::new(1)],
            })
            .await
            .expect("track archive");

        service.integrity_check().await.expect("check");

        assert!(!upload_dir.join("99").exists());
        assert!(!upload_dir.join("abc.tmp.tar").exists());
        assert!(!upload_dir.join("stale.tar").exists());
        assert!(service.upload_stack.is_empty());

        // A second run with no intervening changes is a no-op.
        let before: Vec<String> = std::fs::read_dir(&upload_dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        service.integrity_check().await.expect("second check");
        let after: Vec<String> = std::fs::read_dir(&upload_dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(before, after);
        assert!(service.upload_stack.is_empty());
    }

    #[tokio::test]
    async fn trackfile_backup_uploads_only_when_mtime_advances() {
        let root = tempdir();
        let cfg = config(root.path());
        let (service, store) =
            service_with(cfg, StaticObligations::new(ObligationsModel::default()));
        service.init().await.expect("init");

        service.backup_archives_trackfile().await.expect("backup");
        assert_eq!(store.upload_count(), 1);
        assert!(store.contains(ARCHIVES_TRACKING_FILENAME));

        // Unchanged trackfile, no re-upload.
        service.backup_archives_trackfile().await.expect("backup");
        assert_eq!(store.upload_count(), 1);
    }
}
