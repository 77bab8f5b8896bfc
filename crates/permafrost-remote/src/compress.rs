//! Archive building via an external `tar` subprocess.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};
use crate::Compressor;

/// [`Compressor`] backed by the system `tar` binary.
///
/// In plain mode it produces uncompressed `.tar` archives (the no-op
/// compressor); with a zstd codec it pipes through the external `zstd`
/// binary. CPU-bound compression therefore never runs inline on the engine's
/// scheduler.
pub struct TarCompressor {
    zstd: bool,
    default_level: Option<u32>,
}

impl TarCompressor {
    /// Plain `tar` archives without compression.
    #[must_use]
    pub const fn plain() -> Self {
        Self {
            zstd: false,
            default_level: None,
        }
    }

    /// `tar` archives compressed through the external `zstd` binary.
    #[must_use]
    pub const fn zstd(default_level: Option<u32>) -> Self {
        Self {
            zstd: true,
            default_level,
        }
    }

    fn codec_args(&self, level: Option<u32>) -> Vec<String> {
        if !self.zstd {
            return Vec::new();
        }
        let program = level
            .or(self.default_level)
            .map_or_else(|| "zstd".to_string(), |level| format!("zstd -{level}"));
        vec!["-I".to_string(), program]
    }

    async fn run_tar(operation: &'static str, args: Vec<String>) -> RemoteResult<Vec<u8>> {
        let output = Command::new("tar")
            .args(&args)
            .output()
            .await
            .map_err(|source| RemoteError::io(operation, "tar", source))?;
        if !output.status.success() {
            return Err(RemoteError::Subprocess {
                operation,
                program: "tar",
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Compressor for TarCompressor {
    async fn compress_files(
        &self,
        paths: &[PathBuf],
        archive_path: &Path,
        level: Option<u32>,
    ) -> RemoteResult<()> {
        let mut args = self.codec_args(level);
        args.push("-cf".to_string());
        args.push(archive_path.to_string_lossy().into_owned());
        for path in paths {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| RemoteError::backend("compress.member", "path has no file name"))?;
            args.push("-C".to_string());
            args.push(parent.to_string_lossy().into_owned());
            args.push(name.to_string_lossy().into_owned());
        }
        Self::run_tar("compress.tar", args).await?;
        debug!(archive = %archive_path.display(), members = paths.len(), "archive built");
        Ok(())
    }

    async fn list_files(&self, archive_path: &Path) -> RemoteResult<Vec<String>> {
        let mut args = if self.zstd {
            vec!["-I".to_string(), "zstd".to_string()]
        } else {
            Vec::new()
        };
        args.push("-tf".to_string());
        args.push(archive_path.to_string_lossy().into_owned());
        let stdout = Self::run_tar("list.tar", args).await?;
        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .map(|line| line.trim_end_matches('/').to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    fn extension(&self) -> &'static str {
        if self.zstd { "tar.zst" } else { "tar" }
    }
}
