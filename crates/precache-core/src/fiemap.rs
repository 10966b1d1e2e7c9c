//! FIEMAP extent-map queries.
//!
//! Asks the filesystem where a file's bytes live on the block device. The
//! ioctl returns extents in ascending logical order, possibly in several
//! windows; the query resumes each window at `logical + length` of the last
//! extent seen.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::{debug, trace};

use crate::resolver::Resolver;
use crate::segment::{Segment, SegmentPool};

/// Extent records requested per ioctl window.
const EXTENT_BATCH: usize = 1000;

/// `FIEMAP_EXTENT_LAST`: this extent is the final one in the file.
const EXTENT_FLAG_LAST: u32 = 0x0000_0001;

/// `FS_IOC_FIEMAP` = `_IOWR('f', 11, struct fiemap)`.
const FS_IOC_FIEMAP: libc::c_ulong = 0xc020_660b;

#[repr(C)]
#[derive(Clone, Copy)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
struct FiemapRequest {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
    fm_extents: [FiemapExtent; EXTENT_BATCH],
}

/// Clamps an extent against the file size seen at enumeration time.
///
/// Returns the usable length, or `None` when the extent starts past the
/// end of the file or clamps down to nothing.
fn clamp_extent(logical: u64, length: u64, file_size: u64) -> Option<u64> {
    if logical > file_size {
        return None;
    }
    let clamped = length.min(file_size - logical);
    (clamped > 0).then_some(clamped)
}

/// Enumerates the physical extents of `path` into `pool`.
///
/// The path is resolved through the EncFS mapper first, so the extent map
/// describes the real on-disk file. Returns the number of segments
/// appended. Best-effort: any resolve/open/stat/ioctl failure ends the
/// enumeration for this file and leaves whatever was already collected.
pub fn enumerate_file_segments(
    resolver: &mut Resolver,
    path: &Path,
    pool: &mut SegmentPool,
) -> usize {
    let resolved = resolver.resolve(path);

    let file = match File::open(&resolved) {
        Ok(file) => file,
        Err(err) => {
            debug!(path = %resolved.display(), %err, "cannot open for extent query");
            return 0;
        }
    };
    let file_size = match file.metadata() {
        Ok(meta) => meta.size(),
        Err(err) => {
            debug!(path = %resolved.display(), %err, "cannot stat for extent query");
            return 0;
        }
    };

    // SAFETY: FiemapRequest is a plain #[repr(C)] struct for which zeroes
    // are a valid bit pattern.
    let mut request: Box<FiemapRequest> = unsafe { Box::new(std::mem::zeroed()) };

    let mut appended = 0;
    let mut pos = 0u64;
    let mut last_extent_seen = false;
    while pos < file_size && !last_extent_seen {
        request.fm_start = pos;
        request.fm_length = u64::MAX;
        request.fm_flags = 0;
        request.fm_mapped_extents = 0;
        request.fm_extent_count = EXTENT_BATCH as u32;

        // SAFETY: fd is a valid open file and the request points to a
        // buffer with room for fm_extent_count extent records.
        let request_ptr: *mut FiemapRequest = &mut *request;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_FIEMAP, request_ptr) };
        if rc != 0 {
            debug!(path = %resolved.display(), "FIEMAP ioctl failed");
            break;
        }
        if request.fm_mapped_extents == 0 {
            // No extents and no LAST flag: nothing left to resume from.
            break;
        }

        for extent in &request.fm_extents[..request.fm_mapped_extents as usize] {
            pos = extent.fe_logical + extent.fe_length;
            if extent.fe_flags & EXTENT_FLAG_LAST != 0 {
                last_extent_seen = true;
            }

            let Some(length) = clamp_extent(extent.fe_logical, extent.fe_length, file_size) else {
                continue;
            };
            trace!(
                path = %resolved.display(),
                physical = extent.fe_physical,
                offset = extent.fe_logical,
                length,
                "extent"
            );
            pool.push(Segment {
                file_name: resolved.clone(),
                physical_pos: extent.fe_physical,
                file_offset: extent.fe_logical,
                length,
            });
            appended += 1;
        }
    }

    appended
}
