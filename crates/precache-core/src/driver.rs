//! Precache driver: budget admission, enumeration, ordered read-back.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::Config;
use crate::fiemap::enumerate_file_segments;
use crate::reader::FileReader;
use crate::resolver::Resolver;
use crate::segment::SegmentPool;

/// Outcome of one precache event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrecacheStats {
    /// Files admitted under the byte budget and handed to the extent query.
    pub files_queued: usize,
    /// Segments collected across all queued files.
    pub segments: usize,
    /// Bytes actually read back.
    pub bytes_read: u64,
}

/// Seam between the readdir tracker and the driver, so trigger behavior
/// can be exercised without touching the filesystem.
pub trait Precacher {
    /// Precaches `paths`, returning the number of files queued.
    fn precache_paths(&self, resolver: &mut Resolver, paths: &[PathBuf]) -> usize;
}

/// Orchestrates one precache event: optional dirty-page flush, budgeted
/// extent enumeration, global physical sort, sequential read-back.
#[derive(Debug, Clone, Copy)]
pub struct Driver {
    config: Config,
}

impl Driver {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Driver with the process-wide environment configuration.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(Config::get())
    }

    /// Precaches `paths` through the page cache.
    ///
    /// Files are admitted front to back against the byte budget on their
    /// logical sizes, before any extent work: the first file that would
    /// push the cumulative total over the budget stops the iteration and
    /// is not enumerated. Unstatable paths are skipped. The admitted
    /// files' extents are sorted globally by physical position and read
    /// with the per-file reader.
    pub fn precache<I, P>(&self, resolver: &mut Resolver, paths: I) -> PrecacheStats
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        if self.config.sync_first {
            nix::unistd::sync();
        }

        let mut stats = PrecacheStats::default();
        let mut pool = SegmentPool::new();
        let mut size_so_far = 0u64;
        for path in paths {
            let path = path.as_ref();
            let meta = match fs::symlink_metadata(path) {
                Ok(meta) => meta,
                Err(err) => {
                    debug!(path = %path.display(), %err, "skipping unstatable path");
                    continue;
                }
            };
            let size = meta.len();
            if size_so_far.saturating_add(size) > self.config.byte_budget {
                debug!(
                    path = %path.display(),
                    size,
                    size_so_far,
                    budget = self.config.byte_budget,
                    "byte budget reached"
                );
                break;
            }
            size_so_far += size;
            enumerate_file_segments(resolver, path, &mut pool);
            stats.files_queued += 1;
        }
        stats.segments = pool.len();

        pool.sort_by_physical_pos();

        let mut reader = FileReader::new();
        for segment in &pool {
            stats.bytes_read += reader.read_segment(segment);
        }

        info!(
            files = stats.files_queued,
            segments = stats.segments,
            bytes = stats.bytes_read,
            "precache event complete"
        );
        stats
    }
}

impl Precacher for Driver {
    fn precache_paths(&self, resolver: &mut Resolver, paths: &[PathBuf]) -> usize {
        self.precache(resolver, paths).files_queued
    }
}
