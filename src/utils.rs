//! Shared filesystem helpers
//!
//! Platform-dependent metadata access lives here so the walker never has to
//! reason about `cfg` attributes itself.

use std::fs::{Metadata, ReadDir};
use std::path::Path;

/// Bytes in one reported megabyte
pub const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// Which per-file metadata field counts as the entry's storage cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum BlockMetric {
    /// Bytes actually allocated on disk (`st_blocks * 512`)
    #[default]
    Allocated,
    /// Preferred I/O block size (`st_blksize`), as summed by the legacy plugin
    IoBlock,
}

/// Storage cost of one entry, if the platform reports it.
///
/// Returns `None` where the metadata field does not exist; callers count
/// that as zero.
#[cfg(unix)]
pub fn block_usage(meta: &Metadata, metric: BlockMetric) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;

    match metric {
        // st_blocks is always in 512-byte units regardless of filesystem block size
        BlockMetric::Allocated => meta.blocks().checked_mul(512),
        BlockMetric::IoBlock => Some(meta.blksize()),
    }
}

#[cfg(not(unix))]
pub fn block_usage(_meta: &Metadata, _metric: BlockMetric) -> Option<u64> {
    None
}

/// Truncating conversion to whole megabytes
pub fn to_megabytes(bytes: u64) -> u64 {
    bytes / BYTES_PER_MEGABYTE
}

/// `read_dir` that retries with a `\\?\` long path when the normal path is too long
///
/// Deep cache hierarchies can exceed MAX_PATH (260 characters).
#[cfg(windows)]
pub fn safe_read_dir(path: &Path) -> std::io::Result<ReadDir> {
    match std::fs::read_dir(path) {
        Ok(r) => Ok(r),
        // ERROR_PATH_NOT_FOUND
        Err(e) if e.raw_os_error() == Some(3) => {
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()?.join(path)
            };
            std::fs::read_dir(format!(r"\\?\{}", absolute.display()))
        }
        Err(e) => Err(e),
    }
}

#[cfg(not(windows))]
pub fn safe_read_dir(path: &Path) -> std::io::Result<ReadDir> {
    std::fs::read_dir(path)
}

/// Human-readable size for log output
pub fn format_size(bytes: u64) -> String {
    bytesize::to_string(bytes, true)
}
