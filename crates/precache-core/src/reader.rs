//! Segment readers: stream extent data to warm caches.
//!
//! The bytes themselves are discarded. Reading a file extent at its
//! logical offset populates the kernel page cache; reading the raw device
//! at the physical position at least stages the blocks in the drive's own
//! cache without a seek storm.

use std::fs::File;
use std::io;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::uio::pread;
use tracing::debug;

use crate::segment::Segment;

/// Scratch buffer size for positioned reads.
const READ_BUF_LEN: usize = 512 * 1024;

/// Reads `length` bytes from `file` starting at `offset`, retrying on
/// EINTR. Stops early at EOF or on the first non-retryable error. Returns
/// the number of bytes actually read.
fn drain_range(file: &File, offset: u64, length: u64, buf: &mut [u8]) -> u64 {
    let mut remaining = length;
    let mut pos = offset;
    let mut total = 0u64;
    while remaining > 0 {
        #[allow(clippy::cast_possible_truncation)]
        let chunk = remaining.min(buf.len() as u64) as usize;
        #[allow(clippy::cast_possible_wrap)]
        match pread(file, &mut buf[..chunk], pos as libc::off_t) {
            Ok(0) => break,
            Ok(n) => {
                let n = n as u64;
                total += n;
                pos += n;
                remaining -= n;
            }
            Err(Errno::EINTR) => continue,
            Err(err) => {
                debug!(%err, offset = pos, "segment read failed");
                break;
            }
        }
    }
    total
}

/// Reads each segment from its owning file at the segment's file offset.
#[derive(Debug)]
pub struct FileReader {
    buf: Vec<u8>,
}

impl Default for FileReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FileReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0; READ_BUF_LEN],
        }
    }

    /// Opens the segment's file and drains its extent through the page
    /// cache. A file that cannot be opened reads as zero bytes.
    pub fn read_segment(&mut self, segment: &Segment) -> u64 {
        let file = match File::open(&segment.file_name) {
            Ok(file) => file,
            Err(err) => {
                debug!(path = %segment.file_name.display(), %err, "cannot open segment file");
                return 0;
            }
        };
        drain_range(&file, segment.file_offset, segment.length, &mut self.buf)
    }
}

/// Reads segments from a pre-opened raw block device at their physical
/// positions.
#[derive(Debug)]
pub struct RawDeviceReader {
    device: File,
    buf: Vec<u8>,
}

impl RawDeviceReader {
    #[must_use]
    pub fn new(device: File) -> Self {
        Self {
            device,
            buf: vec![0; READ_BUF_LEN],
        }
    }

    /// Opens `path` read-only as the raw device.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(File::open(path)?))
    }

    pub fn read_segment(&mut self, segment: &Segment) -> u64 {
        drain_range(
            &self.device,
            segment.physical_pos,
            segment.length,
            &mut self.buf,
        )
    }
}
