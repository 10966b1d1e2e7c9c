//! Breadth-first tree precache over a raw block device.
//!
//! Walking a whole tree usually dwarfs any sensible page-cache budget, so
//! the walker streams each level's extents straight off the device: the
//! drive still sees one sweep in physical order instead of a seek storm,
//! without displacing the page cache wholesale.

use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::dirents;
use crate::fiemap::enumerate_file_segments;
use crate::reader::RawDeviceReader;
use crate::resolver::Resolver;
use crate::segment::SegmentPool;

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("cannot stat walk root {path}: {source}")]
    RootStat {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Statistics from one tree walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    pub directories_visited: usize,
    pub segments_read: usize,
    pub bytes_read: u64,
}

/// Walks the tree under `root` level by level, streaming every level's
/// extents off `device` in ascending physical order. The walk never
/// leaves the filesystem holding `root`.
pub fn walk_tree(
    resolver: &mut Resolver,
    root: &Path,
    device: File,
) -> Result<WalkStats, WalkError> {
    let root_meta = fs::symlink_metadata(root).map_err(|source| WalkError::RootStat {
        path: root.to_path_buf(),
        source,
    })?;
    let root_dev = root_meta.dev();

    let mut reader = RawDeviceReader::new(device);
    let mut stats = WalkStats::default();
    let mut frontier = vec![root.to_path_buf()];
    while !frontier.is_empty() {
        debug!(directories = frontier.len(), "mapping directory level");
        let mut pool = SegmentPool::new();
        for dir in &frontier {
            stats.directories_visited += 1;
            match dirents::list_dir(dir) {
                Ok(entries) => {
                    for entry in entries {
                        if entry.is_dot() {
                            continue;
                        }
                        // Every child goes through the extent query;
                        // non-regular targets yield nothing.
                        enumerate_file_segments(resolver, &dir.join(&entry.name), &mut pool);
                    }
                }
                Err(err) => {
                    debug!(dir = %dir.display(), %err, "cannot scan directory");
                }
            }
        }

        pool.sort_by_physical_pos();
        debug!(segments = pool.len(), "reading level off the raw device");
        for segment in &pool {
            stats.bytes_read += reader.read_segment(segment);
            stats.segments_read += 1;
        }

        let mut next = Vec::new();
        for dir in &frontier {
            next.extend(subdirs_on_device(dir, root_dev));
        }
        frontier = next;
    }

    info!(
        directories = stats.directories_visited,
        segments = stats.segments_read,
        bytes = stats.bytes_read,
        "tree walk complete"
    );
    Ok(stats)
}

/// Children of `dir` that are directories on the same device as the walk
/// root. `.` and `..` are rejected and symlinks are not followed, so the
/// walk stays inside one filesystem and one tree.
pub fn subdirs_on_device(dir: &Path, root_dev: u64) -> Vec<PathBuf> {
    let entries = match dirents::list_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut subdirs = Vec::new();
    for entry in entries {
        if entry.kind != libc::DT_DIR || entry.is_dot() {
            continue;
        }
        let child = dir.join(&entry.name);
        match fs::symlink_metadata(&child) {
            Ok(meta) if meta.dev() == root_dev => subdirs.push(child),
            _ => {}
        }
    }
    subdirs
}

/// Picks the device backing `path` from `/proc/mounts`.
pub fn guess_device_for_path(path: &Path) -> Option<PathBuf> {
    let mounts = fs::read_to_string("/proc/mounts").ok()?;
    select_device(&mounts, path)
}

/// Chooses the mount line whose mount point shares the longest common
/// byte prefix with `path`, among devices that are absolute paths.
fn select_device(mounts: &str, path: &Path) -> Option<PathBuf> {
    use std::os::unix::ffi::OsStrExt;

    let path = path.as_os_str().as_bytes();
    let mut best_len = 0;
    let mut best = None;
    for line in mounts.lines() {
        let mut fields = line.split(' ');
        let (Some(device), Some(mount_point)) = (fields.next(), fields.next()) else {
            continue;
        };
        if !device.starts_with('/') {
            continue;
        }
        let common = common_prefix_len(mount_point.as_bytes(), path);
        if common > best_len {
            best_len = common;
            best = Some(device);
        }
    }
    best.map(PathBuf::from)
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
