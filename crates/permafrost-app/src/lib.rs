#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Wires the lifecycle engine together: configuration, logging and the
//! long-running archive node / one-shot cleanup entry points.
//!
//! The outer surfaces (CLI parsing, RPC backends, blob-store SDKs) live
//! outside this crate; callers inject the obligations source, blob store
//! and compressor behind their traits.

mod config;
mod error;

use std::sync::Arc;

use permafrost_archive::ArchiveService;
use permafrost_remote::{
    BlobStore, Compressor, ObligationsSource, PeerClient, TarCompressor,
};
use permafrost_sync::{CleanupService, CleanupSummary};
use permafrost_tracking::ObjectTrackingStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub use config::{
    CleanupSection, CompressionSection, IntervalsSection, NodeConfig, ThresholdsSection,
    TimeoutsSection, WorkersSection,
};
pub use error::{AppError, AppResult};

/// Default logging filter when `RUST_LOG` is not provided.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// External collaborators injected by the hosting binary.
pub struct NodeDeps {
    /// Source of chain-determined storage obligations.
    pub obligations: Arc<dyn ObligationsSource>,
    /// Remote destination of finished archives.
    pub store: Arc<dyn BlobStore>,
}

/// Configure and install the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if a subscriber has already been installed.
pub fn init_logging() -> AppResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| AppError::Telemetry {
            detail: err.to_string(),
        })
}

fn build_compressor(config: &NodeConfig) -> Arc<dyn Compressor> {
    if config.compression.zstd {
        Arc::new(TarCompressor::zstd(config.compression.level))
    } else {
        Arc::new(TarCompressor::plain())
    }
}

fn build_peer_client(config: &NodeConfig) -> AppResult<PeerClient> {
    PeerClient::new(config.download_timeout(), config.probe_timeout())
        .map_err(|source| AppError::PeerClient { source })
}

/// Run the archive node until the process is terminated.
///
/// Initialization failure is returned to the caller; once the processing
/// loop is running, fatal conditions terminate the process directly.
///
/// # Errors
///
/// Returns an error when the peer client cannot be built or the archive
/// service fails to initialize.
pub async fn run_archive_node(config: NodeConfig, deps: NodeDeps) -> AppResult<()> {
    config.validate()?;
    let peer = build_peer_client(&config)?;
    let service = Arc::new(ArchiveService::new(
        config.archive_config(),
        deps.obligations,
        deps.store,
        build_compressor(&config),
        peer,
    ));
    service.init().await?;
    info!("archive node started");
    service.run().await;
    Ok(())
}

/// Run one cleanup pass against the configured upload queue directory.
///
/// # Errors
///
/// Returns an error when configuration or trackfile loading fails, when the
/// obligations source is stale, or when an obligations query fails.
pub async fn run_cleanup_pass(config: NodeConfig, deps: NodeDeps) -> AppResult<CleanupSummary> {
    config.validate()?;
    let peer = build_peer_client(&config)?;
    let tracking = Arc::new(ObjectTrackingStore::new(&config.upload_queue_dir));
    tracking.init().await?;
    let service = CleanupService::new(
        deps.obligations,
        peer,
        tracking,
        config.upload_queue_dir.clone(),
        config.bucket_ids(),
        config.cleanup_config(),
    );
    let summary = service.run_pass().await?;
    Ok(summary)
}
