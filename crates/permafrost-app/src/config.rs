//! YAML node configuration with defaults and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use permafrost_archive::{ArchiveConfig, UploadThresholds};
use permafrost_model::BucketId;
use permafrost_sync::CleanupConfig;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Node configuration as loaded from a YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Durable queue directory for objects, archives and trackfiles.
    pub upload_queue_dir: PathBuf,
    /// Scratch directory for partial downloads.
    pub tmp_download_dir: PathBuf,
    /// Buckets operated by this node.
    pub buckets: Vec<String>,
    /// This node's own operator URLs, excluded from download candidates.
    #[serde(default)]
    pub own_operator_urls: Vec<String>,
    /// Hard cap on the upload queue directory size, in bytes.
    #[serde(default = "default_upload_dir_size_limit")]
    pub upload_dir_size_limit: u64,
    /// Target combined member size per archive, in bytes.
    #[serde(default = "default_archive_size_limit")]
    pub archive_size_limit: u64,
    /// Compression/upload triggers.
    #[serde(default)]
    pub thresholds: ThresholdsSection,
    /// Worker pool sizes.
    #[serde(default)]
    pub workers: WorkersSection,
    /// Loop and timer intervals.
    #[serde(default)]
    pub intervals: IntervalsSection,
    /// Per-request network timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    /// Archive compression settings.
    #[serde(default)]
    pub compression: CompressionSection,
    /// Cleanup service settings.
    #[serde(default)]
    pub cleanup: CleanupSection,
}

/// Upload trigger thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdsSection {
    /// Combined queued size, in bytes, that triggers an upload.
    #[serde(default = "default_size_threshold")]
    pub size: u64,
    /// Queued object count that triggers an upload, when set.
    #[serde(default)]
    pub count: Option<usize>,
    /// Oldest queued object age, in minutes, that triggers an upload.
    #[serde(default = "default_age_threshold_minutes")]
    pub age_minutes: u64,
}

impl Default for ThresholdsSection {
    fn default() -> Self {
        Self {
            size: default_size_threshold(),
            count: None,
            age_minutes: default_age_threshold_minutes(),
        }
    }
}

/// Worker pool sizes per orchestrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersSection {
    /// Download workers.
    #[serde(default = "default_sync_workers")]
    pub sync: usize,
    /// Compression/upload workers.
    #[serde(default = "default_upload_workers")]
    pub upload: usize,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            sync: default_sync_workers(),
            upload: default_upload_workers(),
        }
    }
}

/// Loop and timer intervals.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntervalsSection {
    /// Idle-stage pause between processing iterations, in minutes.
    #[serde(default = "default_sync_interval_minutes")]
    pub sync_minutes: u64,
    /// Backpressure re-check pause, in seconds.
    #[serde(default = "default_backpressure_secs")]
    pub backpressure_secs: u64,
    /// Archives-trackfile backup timer period, in minutes.
    #[serde(default = "default_trackfile_backup_minutes")]
    pub trackfile_backup_minutes: u64,
}

impl Default for IntervalsSection {
    fn default() -> Self {
        Self {
            sync_minutes: default_sync_interval_minutes(),
            backpressure_secs: default_backpressure_secs(),
            trackfile_backup_minutes: default_trackfile_backup_minutes(),
        }
    }
}

/// Per-request network timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsSection {
    /// Single object download timeout, in seconds.
    #[serde(default = "default_download_timeout_secs")]
    pub download_secs: u64,
    /// Replication probe timeout, in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            download_secs: default_download_timeout_secs(),
            probe_secs: default_probe_timeout_secs(),
        }
    }
}

/// Archive compression settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionSection {
    /// Pipe archives through zstd instead of storing plain tar.
    #[serde(default)]
    pub zstd: bool,
    /// Compression level, compressor-defined when unset.
    #[serde(default)]
    pub level: Option<u32>,
}

/// Cleanup service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanupSection {
    /// Peers that must confirm holding a moved object before pruning it.
    #[serde(default = "default_replication_threshold")]
    pub replication_threshold: usize,
    /// Maximum tolerated obligations-source lag, in blocks.
    #[serde(default = "default_max_processing_lag")]
    pub max_processing_lag: u64,
    /// Concurrent existence probes per pass.
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    /// Deletion worker pool size.
    #[serde(default = "default_cleanup_workers")]
    pub workers: usize,
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            replication_threshold: default_replication_threshold(),
            max_processing_lag: default_max_processing_lag(),
            probe_concurrency: default_probe_concurrency(),
            workers: default_cleanup_workers(),
        }
    }
}

const fn default_upload_dir_size_limit() -> u64 {
    20 * 1024 * 1024 * 1024
}
const fn default_archive_size_limit() -> u64 {
    1024 * 1024 * 1024
}
const fn default_size_threshold() -> u64 {
    5 * 1024 * 1024 * 1024
}
const fn default_age_threshold_minutes() -> u64 {
    24 * 60
}
const fn default_sync_workers() -> usize {
    8
}
const fn default_upload_workers() -> usize {
    4
}
const fn default_sync_interval_minutes() -> u64 {
    20
}
const fn default_backpressure_secs() -> u64 {
    60
}
const fn default_trackfile_backup_minutes() -> u64 {
    60
}
const fn default_download_timeout_secs() -> u64 {
    900
}
const fn default_probe_timeout_secs() -> u64 {
    10
}
const fn default_replication_threshold() -> usize {
    2
}
const fn default_max_processing_lag() -> u64 {
    100
}
const fn default_probe_concurrency() -> usize {
    20
}
const fn default_cleanup_workers() -> usize {
    20
}

impl NodeConfig {
    /// Load and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed, or when the
    /// parsed configuration fails validation.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| AppError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self =
            serde_yaml::from_str(&raw).map_err(|source| AppError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConfigInvalid`] naming the first violated rule.
    pub fn validate(&self) -> AppResult<()> {
        if self.buckets.is_empty() {
            return Err(AppError::invalid("at least one bucket must be configured"));
        }
        if self.upload_queue_dir == self.tmp_download_dir {
            return Err(AppError::invalid(
                "upload_queue_dir and tmp_download_dir must differ",
            ));
        }
        if self.workers.sync == 0 || self.workers.upload == 0 {
            return Err(AppError::invalid("worker pool sizes must be non-zero"));
        }
        if self.thresholds.size == 0 {
            return Err(AppError::invalid("size threshold must be non-zero"));
        }
        if self.archive_size_limit > self.upload_dir_size_limit {
            return Err(AppError::invalid(
                "archive_size_limit cannot exceed upload_dir_size_limit",
            ));
        }
        if self.cleanup.replication_threshold == 0 {
            return Err(AppError::invalid("replication_threshold must be non-zero"));
        }
        Ok(())
    }

    /// Buckets as typed identifiers.
    #[must_use]
    pub fn bucket_ids(&self) -> Vec<BucketId> {
        self.buckets.iter().map(BucketId::new).collect()
    }

    /// Download timeout as a [`Duration`].
    #[must_use]
    pub const fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.download_secs)
    }

    /// Probe timeout as a [`Duration`].
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.probe_secs)
    }

    /// Project the archival orchestrator's configuration.
    #[must_use]
    pub fn archive_config(&self) -> ArchiveConfig {
        ArchiveConfig {
            upload_queue_dir: self.upload_queue_dir.clone(),
            tmp_download_dir: self.tmp_download_dir.clone(),
            upload_dir_size_limit: self.upload_dir_size_limit,
            archive_size_limit: self.archive_size_limit,
            thresholds: UploadThresholds {
                size: self.thresholds.size,
                count: self.thresholds.count,
                age_minutes: self.thresholds.age_minutes,
            },
            sync_workers: self.workers.sync,
            upload_workers: self.workers.upload,
            sync_interval: Duration::from_secs(self.intervals.sync_minutes * 60),
            backpressure_interval: Duration::from_secs(self.intervals.backpressure_secs),
            trackfile_backup_interval: Duration::from_secs(
                self.intervals.trackfile_backup_minutes * 60,
            ),
            compression_level: self.compression.level,
            own_buckets: self.bucket_ids(),
            own_operator_urls: self.own_operator_urls.clone(),
        }
    }

    /// Project the cleanup service's configuration.
    #[must_use]
    pub fn cleanup_config(&self) -> CleanupConfig {
        CleanupConfig {
            replication_threshold: self.cleanup.replication_threshold,
            max_processing_lag: self.cleanup.max_processing_lag,
            probe_concurrency: self.cleanup.probe_concurrency,
            workers: self.cleanup.workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
upload_queue_dir: /data/queue
tmp_download_dir: /data/tmp
buckets: [\"1\"]
";

    #[test]
    fn minimal_config_gets_defaults() {
        let config: NodeConfig = serde_yaml::from_str(MINIMAL).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.workers.sync, 8);
        assert_eq!(config.workers.upload, 4);
        assert_eq!(config.thresholds.count, None);
        assert_eq!(config.cleanup.replication_threshold, 2);
        assert_eq!(config.download_timeout(), Duration::from_secs(900));
    }

    #[test]
    fn empty_buckets_are_rejected() {
        let yaml = "\
upload_queue_dir: /data/queue
tmp_download_dir: /data/tmp
buckets: []
";
        let config: NodeConfig = serde_yaml::from_str(yaml).expect("parse");
        assert!(matches!(
            config.validate(),
            Err(AppError::ConfigInvalid { .. })
        ));
    }

    #[test]
    fn shared_directories_are_rejected() {
        let yaml = "\
upload_queue_dir: /data/queue
tmp_download_dir: /data/queue
buckets: [\"1\"]
";
        let config: NodeConfig = serde_yaml::from_str(yaml).expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = format!("{MINIMAL}surprise: true\n");
        assert!(serde_yaml::from_str::<NodeConfig>(&yaml).is_err());
    }

    #[test]
    fn sections_override_defaults() {
        let yaml = "\
upload_queue_dir: /data/queue
tmp_download_dir: /data/tmp
buckets: [\"1\", \"2\"]
thresholds:
  size: 1024
  count: 500
workers:
  sync: 2
  upload: 1
compression:
  zstd: true
  level: 9
";
        let config: NodeConfig = serde_yaml::from_str(yaml).expect("parse");
        config.validate().expect("valid");
        let archive = config.archive_config();
        assert_eq!(archive.thresholds.count, Some(500));
        assert_eq!(archive.compression_level, Some(9));
        assert_eq!(archive.own_buckets.len(), 2);
    }
}
