//! Rate-limited recursive usage walker
//!
//! Depth-first, single-threaded traversal of a cache directory. Every entry
//! costs one limiter token, taken before its metadata is read. The first
//! error aborts the whole scan: a monitoring sample is either complete or
//! withheld.
//!
//! ```text
//! Listing → (per entry) Throttling → {Recursing | Measuring} → Accumulating → Done | Failed
//! ```

use crate::error::{ConfigError, Result, ScanError};
use crate::limiter::{CancellationToken, Clock, Limiter, SystemClock, DEFAULT_STAT_BURST, DEFAULT_STAT_RATE};
use crate::utils::{self, BlockMetric};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Advisory depth bound used when none is configured
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Depth bound for a traversal.
///
/// By default the bound is advisory and traversal is unbounded. Setting
/// `enforce` stops the walker from listing directories deeper than
/// `max_depth`; those subtrees contribute nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthLimit {
    pub max_depth: usize,
    pub enforce: bool,
}

impl DepthLimit {
    pub fn advisory(max_depth: usize) -> Self {
        Self { max_depth, enforce: false }
    }

    pub fn enforced(max_depth: usize) -> Self {
        Self { max_depth, enforce: true }
    }

    /// Whether `depth` lies beyond the bound, regardless of enforcement
    pub fn exceeds(&self, depth: usize) -> bool {
        depth > self.max_depth
    }

    /// Whether the walker may descend into a directory at `depth`
    pub fn allows(&self, depth: usize) -> bool {
        !self.enforce || !self.exceeds(depth)
    }
}

impl Default for DepthLimit {
    fn default() -> Self {
        Self::advisory(DEFAULT_MAX_DEPTH)
    }
}

/// Parameters of one scan. Not modified while the scan runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub root: PathBuf,
    pub depth_limit: DepthLimit,
    /// Stat permits per second
    pub rate: f64,
    pub burst: u32,
    pub metric: BlockMetric,
}

impl ScanRequest {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            depth_limit: DepthLimit::default(),
            rate: DEFAULT_STAT_RATE,
            burst: DEFAULT_STAT_BURST,
            metric: BlockMetric::default(),
        }
    }

    /// A fresh limiter configured for this request, owned by the caller
    pub fn build_limiter(&self) -> std::result::Result<Limiter<SystemClock>, ConfigError> {
        Limiter::new(self.rate, self.burst)
    }
}

/// Outcome of a completed scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Storage-block usage of the tree below the root
    pub usage: u64,
    /// Entries that consumed a stat token
    pub entries: u64,
    /// Directories listed, the root included
    pub directories: u64,
    pub duration: Duration,
}

impl ScanSummary {
    pub fn usage_megabytes(&self) -> u64 {
        utils::to_megabytes(self.usage)
    }
}

/// Walks one directory tree against a borrowed limiter
pub struct UsageWalker<'a, C: Clock = SystemClock> {
    limiter: &'a mut Limiter<C>,
    cancel: &'a CancellationToken,
    depth_limit: DepthLimit,
    metric: BlockMetric,
    entries: u64,
    directories: u64,
}

impl<'a, C: Clock> UsageWalker<'a, C> {
    pub fn new(
        limiter: &'a mut Limiter<C>,
        cancel: &'a CancellationToken,
        depth_limit: DepthLimit,
        metric: BlockMetric,
    ) -> Self {
        Self {
            limiter,
            cancel,
            depth_limit,
            metric,
            entries: 0,
            directories: 0,
        }
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn directories(&self) -> u64 {
        self.directories
    }

    /// Usage of the subtree rooted at `dir`, which sits at recursion `depth`.
    ///
    /// On error the returned [`ScanError`] carries the partial total of the
    /// failing chain; it must not be reported as a measurement.
    pub fn walk(&mut self, dir: &Path, depth: usize) -> Result<u64> {
        let listing = utils::safe_read_dir(dir).map_err(|source| ScanError::ReadDir {
            path: dir.to_path_buf(),
            source,
            partial_usage: 0,
        })?;
        self.directories += 1;

        let mut usage = 0u64;
        for entry in listing {
            let entry = entry.map_err(|source| ScanError::ReadEntry {
                path: dir.to_path_buf(),
                source,
                partial_usage: usage,
            })?;

            if self.limiter.acquire(self.cancel).is_err() {
                return Err(ScanError::Cancelled { partial_usage: usage });
            }
            self.entries += 1;

            let path = entry.path();
            // DirEntry::file_type does not follow symlinks
            let file_type = entry.file_type().map_err(|source| ScanError::Metadata {
                path: path.clone(),
                source,
                partial_usage: usage,
            })?;

            if file_type.is_dir() {
                let child_depth = depth + 1;
                if !self.depth_limit.allows(child_depth) {
                    debug!(
                        "Skipping {} at depth {} (limit {})",
                        path.display(),
                        child_depth,
                        self.depth_limit.max_depth
                    );
                    continue;
                }
                let subtree = self
                    .walk(&path, child_depth)
                    .map_err(|e| e.add_partial(usage))?;
                usage = usage.saturating_add(subtree);
            } else {
                let meta = entry.metadata().map_err(|source| ScanError::Metadata {
                    path: path.clone(),
                    source,
                    partial_usage: usage,
                })?;
                let cost = utils::block_usage(&meta, self.metric).unwrap_or(0);
                trace!("{}: {}", path.display(), cost);
                usage = usage.saturating_add(cost);
            }
        }

        Ok(usage)
    }
}

/// Scan `request.root` from depth 0 using a caller-owned limiter
pub fn scan<C: Clock>(
    request: &ScanRequest,
    limiter: &mut Limiter<C>,
    cancel: &CancellationToken,
) -> Result<ScanSummary> {
    let start = Instant::now();
    debug!(
        "Scanning {} (rate {}/s, burst {}, {:?})",
        request.root.display(),
        limiter.rate(),
        limiter.burst(),
        request.depth_limit
    );

    let mut walker = UsageWalker::new(limiter, cancel, request.depth_limit, request.metric);
    let usage = walker.walk(&request.root, 0)?;

    let summary = ScanSummary {
        usage,
        entries: walker.entries(),
        directories: walker.directories(),
        duration: start.elapsed(),
    };
    debug!(
        "Scanned {} entries in {} directories: {} in {:.2?}",
        summary.entries,
        summary.directories,
        utils::format_size(summary.usage),
        summary.duration
    );
    Ok(summary)
}
