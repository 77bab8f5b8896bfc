//! Generic append-only line log with cross-process advisory locking.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::error::{TrackingError, TrackingResult};

/// Line parser/serializer for one trackfile entry kind.
pub trait EntryCodec: Send + Sync + 'static {
    /// Decoded entry type.
    type Entry: Send;

    /// Serialize an entry to a single log line (without the newline).
    fn encode(entry: &Self::Entry) -> Result<String, String>;

    /// Parse a single log line.
    fn decode(line: &str) -> Result<Self::Entry, String>;
}

/// Bounded-retry policy for advisory lock acquisition.
///
/// Concurrent readers/writers serialize by retrying at a fixed short interval
/// instead of blocking, so two processes sharing a directory cannot
/// busy-deadlock on the trackfile.
#[derive(Debug, Clone, Copy)]
pub struct LockRetryPolicy {
    /// Sleep between acquisition attempts.
    pub interval: Duration,
    /// Maximum number of acquisition attempts.
    pub max_attempts: u32,
}

impl Default for LockRetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(50),
            max_attempts: 600,
        }
    }
}

struct FileLock {
    file: File,
}

impl FileLock {
    async fn acquire(path: &Path, policy: LockRetryPolicy) -> TrackingResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| TrackingError::io("lock.open", path, source))?;
        for _ in 0..policy.max_attempts {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    tokio::time::sleep(policy.interval).await;
                }
                Err(source) => return Err(TrackingError::io("lock.acquire", path, source)),
            }
        }
        Err(TrackingError::LockTimeout {
            path: path.to_path_buf(),
            attempts: policy.max_attempts,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Append-only log of codec-defined entries, one per line, safe to tail.
///
/// All file operations run under an exclusive advisory lock on a sibling
/// `<name>.lock` file.
pub struct TrackfileStore<C: EntryCodec> {
    path: PathBuf,
    lock_path: PathBuf,
    retry: LockRetryPolicy,
    _codec: PhantomData<C>,
}

impl<C: EntryCodec> TrackfileStore<C> {
    /// Create a store over the given trackfile path.
    #[must_use]
    pub fn new(path: PathBuf, retry: LockRetryPolicy) -> Self {
        let mut lock_name = path
            .file_name()
            .map_or_else(|| "trackfile".to_string(), |n| n.to_string_lossy().into_owned());
        lock_name.push_str(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            retry,
            _codec: PhantomData,
        }
    }

    /// Path of the underlying trackfile.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the trackfile if absent.
    pub async fn init(&self) -> TrackingResult<()> {
        let _lock = FileLock::acquire(&self.lock_path, self.retry).await?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| TrackingError::io("init.create", &self.path, source))?;
        Ok(())
    }

    /// Append one entry to the log.
    pub async fn append(&self, entry: &C::Entry) -> TrackingResult<()> {
        let line = C::encode(entry).map_err(|detail| TrackingError::EncodeFailure {
            path: self.path.clone(),
            detail,
        })?;
        let _lock = FileLock::acquire(&self.lock_path, self.retry).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| TrackingError::io("append.open", &self.path, source))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.sync_data())
            .map_err(|source| TrackingError::io("append.write", &self.path, source))?;
        Ok(())
    }

    /// Read the full log, reconstructing every entry in order.
    pub async fn load(&self) -> TrackingResult<Vec<C::Entry>> {
        let _lock = FileLock::acquire(&self.lock_path, self.retry).await?;
        self.read_entries()
    }

    /// Read the full log, then atomically rewrite it with a compacted entry
    /// list derived from what was read. Returns the compacted entries.
    ///
    /// Bounds log growth across restarts: the rewrite lands via a temp file
    /// renamed over the original, so a crash mid-compaction leaves the
    /// previous log intact.
    pub async fn load_compacted<F>(&self, compact: F) -> TrackingResult<Vec<C::Entry>>
    where
        F: FnOnce(Vec<C::Entry>) -> Vec<C::Entry>,
    {
        let _lock = FileLock::acquire(&self.lock_path, self.retry).await?;
        let entries = self.read_entries()?;
        let compacted = compact(entries);

        let mut lines = String::new();
        for entry in &compacted {
            let line = C::encode(entry).map_err(|detail| TrackingError::EncodeFailure {
                path: self.path.clone(),
                detail,
            })?;
            lines.push_str(&line);
            lines.push('\n');
        }

        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, lines.as_bytes())
            .map_err(|source| TrackingError::io("compact.write", &tmp_path, source))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|source| TrackingError::io("compact.rename", &self.path, source))?;
        Ok(compacted)
    }

    fn read_entries(&self) -> TrackingResult<Vec<C::Entry>> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|source| TrackingError::io("load.read", &self.path, source))?;
        let mut entries = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry = C::decode(line).map_err(|detail| TrackingError::CorruptEntry {
                path: self.path.clone(),
                line_number: index + 1,
                detail,
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map_or_else(|| "trackfile".to_string(), |n| n.to_string_lossy().into_owned());
        name.push_str(".tmp");
        self.path.with_file_name(name)
    }
}
