//! Raw directory enumeration via the `getdents64` syscall.
//!
//! The resolver and walker deliberately bypass libc's `readdir`: in the
//! interposed deployment those entry points are the ones being hooked, and
//! re-entering them from inside the engine would feed the heuristics our
//! own traffic.

use std::ffi::{CStr, OsString};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

const DIRENT_BUF_LEN: usize = 32 * 1024;

/// Byte offsets of the fixed fields of a `linux_dirent64` record.
const D_RECLEN_OFFSET: usize = 16;
const D_TYPE_OFFSET: usize = 18;
const D_NAME_OFFSET: usize = 19;

/// A directory entry as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDirEntry {
    pub ino: u64,
    /// `DT_*` constant; `DT_UNKNOWN` on filesystems that do not fill it.
    pub kind: u8,
    pub name: OsString,
}

impl RawDirEntry {
    /// True for the `.` and `..` entries.
    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Opens `dir` and returns every entry, including `.` and `..`.
pub fn list_dir(dir: &Path) -> io::Result<Vec<RawDirEntry>> {
    let file = File::options()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(dir)?;

    let mut entries = Vec::new();
    let mut buf = vec![0u8; DIRENT_BUF_LEN];
    loop {
        // SAFETY: fd is an open directory and buf is writable for its full
        // length; the kernel writes at most DIRENT_BUF_LEN bytes.
        let nread = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                file.as_raw_fd(),
                buf.as_mut_ptr(),
                DIRENT_BUF_LEN,
            )
        };
        if nread < 0 {
            return Err(io::Error::last_os_error());
        }
        if nread == 0 {
            break;
        }

        #[allow(clippy::cast_sign_loss)]
        let nread = nread as usize;
        let mut pos = 0;
        while pos + D_NAME_OFFSET < nread {
            // SAFETY: the kernel guarantees a well-formed, NUL-terminated
            // linux_dirent64 record at every `pos` it reports, and `pos`
            // stays within the `nread` bytes it just wrote.
            let (ino, reclen, kind, name) = unsafe {
                let rec = buf.as_ptr().add(pos);
                let ino = rec.cast::<u64>().read_unaligned();
                let reclen = rec.add(D_RECLEN_OFFSET).cast::<u16>().read_unaligned() as usize;
                let kind = *rec.add(D_TYPE_OFFSET);
                let name = CStr::from_ptr(rec.add(D_NAME_OFFSET).cast());
                (ino, reclen, kind, name.to_bytes().to_vec())
            };
            if reclen == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "zero-length dirent record",
                ));
            }
            entries.push(RawDirEntry {
                ino,
                kind,
                name: OsString::from_vec(name),
            });
            pos += reclen;
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn lists_dot_entries_and_children_with_kernel_inodes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpha"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("beta")).unwrap();

        let entries = list_dir(dir.path()).unwrap();
        let names: Vec<&OsString> = entries.iter().map(|e| &e.name).collect();
        assert!(names.iter().any(|n| *n == "."));
        assert!(names.iter().any(|n| *n == ".."));

        let alpha = entries.iter().find(|e| e.name == "alpha").unwrap();
        let meta = std::fs::symlink_metadata(dir.path().join("alpha")).unwrap();
        assert_eq!(alpha.ino, meta.ino());
        assert!(!alpha.is_dot());

        let beta = entries.iter().find(|e| e.name == "beta").unwrap();
        assert_eq!(beta.kind, libc::DT_DIR);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        assert!(list_dir(&gone).is_err());
    }

    #[test]
    fn opening_a_regular_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        assert!(list_dir(&file).is_err());
    }
}
