//! Error types for the nginx cache plugin
//!
//! Library modules return these typed errors; the CLI layer wraps them in
//! `anyhow` with context before reporting.

use std::path::PathBuf;
use thiserror::Error;

/// Invalid plugin or limiter configuration. Fatal before any scan runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `--size` could not be parsed as an unsigned integer
    #[error("Invalid cache capacity '{value}': {reason}")]
    InvalidCapacity { value: String, reason: String },

    /// Refill rate must be a positive, finite number of permits per second
    #[error("Invalid stat rate {0}: must be a positive number of permits per second")]
    InvalidRate(String),

    /// Burst capacity must hold at least one token
    #[error("Invalid stat burst 0: the bucket must hold at least one token")]
    InvalidBurst,

    /// Cache root was not given
    #[error("Missing proxy_cache_path: pass --path <DIR>")]
    MissingPath,
}

/// Returned by the limiter when the cancellation signal fires before a
/// token is granted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("token acquisition cancelled")]
pub struct Cancelled;

/// Failure of a usage scan.
///
/// Every variant carries the usage accumulated in the failing subtree up to
/// the point of failure. It is diagnostic only: callers must treat any
/// `ScanError` as a failed sample.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Directory could not be listed (permission denied, removed, not a directory)
    #[error("Failed to read directory '{}'", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        partial_usage: u64,
    },

    /// Listing broke off while iterating entries
    #[error("Failed to read entry in '{}'", path.display())]
    ReadEntry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        partial_usage: u64,
    },

    /// Entry metadata could not be read
    #[error("Failed to stat '{}'", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
        partial_usage: u64,
    },

    /// Cancellation signal fired while waiting for a stat token
    #[error("Scan cancelled")]
    Cancelled { partial_usage: u64 },
}

impl ScanError {
    /// Usage accumulated in the failing subtree before the scan aborted
    pub fn partial_usage(&self) -> u64 {
        match self {
            ScanError::ReadDir { partial_usage, .. }
            | ScanError::ReadEntry { partial_usage, .. }
            | ScanError::Metadata { partial_usage, .. }
            | ScanError::Cancelled { partial_usage } => *partial_usage,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScanError::Cancelled { .. })
    }

    /// Add usage from the enclosing directory so the partial total reflects
    /// everything counted before the failure.
    pub(crate) fn add_partial(mut self, usage: u64) -> Self {
        match &mut self {
            ScanError::ReadDir { partial_usage, .. }
            | ScanError::ReadEntry { partial_usage, .. }
            | ScanError::Metadata { partial_usage, .. }
            | ScanError::Cancelled { partial_usage } => {
                *partial_usage = partial_usage.saturating_add(usage);
            }
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
