//! EncFS front→back path resolution.
//!
//! Extent maps are meaningless for a path inside a FUSE overlay: the
//! overlay file is synthesized, only the encrypted file on the backing
//! store has extents. EncFS preserves inode numbers across the overlay,
//! so a front path can be mapped to its backing path by tracing inode
//! numbers through the corresponding directory levels on the back.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::statfs::{statfs, FUSE_SUPER_MAGIC};
use thiserror::Error;
use tracing::{debug, trace};

use crate::dirents;

#[derive(Debug, Error)]
pub enum RefreshError {
    /// `/proc` could not be enumerated; the previous mount table stands.
    #[error("cannot enumerate /proc: {0}")]
    ProcUnreadable(#[source] std::io::Error),
}

/// One live EncFS mount, discovered from the owning process's command line.
#[derive(Debug, Clone)]
struct EncfsMount {
    /// Decrypted overlay mount point visible to applications.
    front: PathBuf,
    /// Directory of encrypted files on the underlying filesystem.
    back: PathBuf,
    /// Pid of the encfs process serving the mount.
    pid: u64,
    /// Mark-and-sweep flag for the refresh cycle.
    pending_removal: bool,
}

/// Maps overlay paths to their backing-store counterparts.
///
/// Holds the front→back mount table and an inode→path cache for the
/// backing side. The cache is purely a shortcut: every entry was read off
/// a real directory listing at insertion time, but nothing invalidates it
/// when the backing store changes underneath the process. That staleness
/// is accepted; a wrong path merely fails to open later.
#[derive(Debug, Default)]
pub struct Resolver {
    /// Probe order is discovery order.
    mounts: Vec<EncfsMount>,
    inode_cache: HashMap<u64, PathBuf>,
    last_refresh_sec: Option<u64>,
}

/// True when `prefix` covers `path` up to a component boundary: the bytes
/// match and the next byte is `/` or the end of the path.
fn is_component_prefix(prefix: &Path, path: &Path) -> bool {
    let prefix = prefix.as_os_str().as_bytes();
    let path = path.as_os_str().as_bytes();
    path.len() >= prefix.len()
        && &path[..prefix.len()] == prefix
        && (path.len() == prefix.len() || path[prefix.len()] == b'/')
}

fn is_fuse_path(path: &Path) -> bool {
    match statfs(path) {
        Ok(fs) => fs.filesystem_type() == FUSE_SUPER_MAGIC,
        Err(_) => false,
    }
}

fn trim_trailing_slashes(bytes: &[u8]) -> PathBuf {
    let mut len = bytes.len();
    while len > 0 && bytes[len - 1] == b'/' {
        len -= 1;
    }
    PathBuf::from(OsString::from_vec(bytes[..len].to_vec()))
}

/// Extracts the (back, front) directory pair from a `/proc/<pid>/cmdline`
/// buffer (NUL-separated argv). argv[0] must be exactly `encfs`; the first
/// two following arguments that do not start with `-` are the backing and
/// mount directories, in that order.
fn parse_encfs_cmdline(cmdline: &[u8]) -> Option<(PathBuf, PathBuf)> {
    let mut args = cmdline.split(|&b| b == 0);
    if args.next()? != b"encfs" {
        return None;
    }
    let mut dirs = args.filter(|arg| !arg.is_empty() && arg[0] != b'-');
    let back = dirs.next()?;
    let front = dirs.next()?;
    Some((trim_trailing_slashes(back), trim_trailing_slashes(front)))
}

/// Collects the inode of every path component from `src` down to (but not
/// including) the mount root `front`, deepest first. Fails when an lstat
/// along the way fails, i.e. when the walk cannot reach `front` exactly.
fn inode_trace(src: &Path, front: &Path) -> Option<Vec<u64>> {
    let front_len = front.as_os_str().len();
    let src = src.as_os_str().as_bytes();
    let mut len = src.len();
    while len > 0 && src[len - 1] == b'/' {
        len -= 1;
    }
    let mut cur = &src[..len];

    let mut inode_trace = Vec::new();
    while cur.len() > front_len {
        let cur_path = Path::new(std::ffi::OsStr::from_bytes(cur));
        let meta = match fs::symlink_metadata(cur_path) {
            Ok(meta) => meta,
            Err(_) => break,
        };
        inode_trace.push(meta.ino());

        let Some(slash) = cur.iter().rposition(|&b| b == b'/') else {
            break;
        };
        cur = &cur[..slash];
        if cur.is_empty() {
            break;
        }
    }

    (cur.len() == front_len && !inode_trace.is_empty()).then_some(inode_trace)
}

impl Resolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current front→back mappings, in probe order.
    #[must_use]
    pub fn mounts(&self) -> Vec<(PathBuf, PathBuf)> {
        self.mounts
            .iter()
            .map(|m| (m.front.clone(), m.back.clone()))
            .collect()
    }

    /// Unconditionally rescans `/proc/*/cmdline` for live encfs processes.
    ///
    /// Mount entries whose process disappeared are purged together with
    /// their inode-cache entries; a mount point taken over by a different
    /// pid replaces the old mapping and invalidates the old backing
    /// directory's cached inodes.
    pub fn force_refresh(&mut self) -> Result<(), RefreshError> {
        let entries =
            dirents::list_dir(Path::new("/proc")).map_err(RefreshError::ProcUnreadable)?;

        for mount in &mut self.mounts {
            mount.pending_removal = true;
        }

        for entry in entries {
            if entry.kind != libc::DT_DIR {
                continue;
            }
            let Some(pid) = entry.name.to_str().and_then(|n| n.parse::<u64>().ok()) else {
                continue;
            };
            let cmdline_path = format!("/proc/{pid}/cmdline");
            let Ok(cmdline) = fs::read(&cmdline_path) else {
                continue;
            };
            let Some((back, front)) = parse_encfs_cmdline(&cmdline) else {
                continue;
            };
            self.record_mount(pid, back, front);
        }

        let stale: Vec<PathBuf> = self
            .mounts
            .iter()
            .filter(|m| m.pending_removal)
            .map(|m| m.back.clone())
            .collect();
        if !stale.is_empty() {
            self.mounts.retain(|m| !m.pending_removal);
            for back in stale {
                debug!(back = %back.display(), "encfs mount disappeared");
                self.forget_back_path(&back);
            }
        }

        Ok(())
    }

    fn record_mount(&mut self, pid: u64, back: PathBuf, front: PathBuf) {
        if let Some(existing) = self.mounts.iter_mut().find(|m| m.front == front) {
            if existing.pid == pid {
                // Same process, same mount: keep it.
                existing.pending_removal = false;
                return;
            }
            debug!(front = %front.display(), old_pid = existing.pid, new_pid = pid,
                   "encfs mount point remounted");
            let old_back = std::mem::replace(&mut existing.back, back);
            existing.pid = pid;
            existing.pending_removal = false;
            self.forget_back_path(&old_back);
            return;
        }

        debug!(front = %front.display(), back = %back.display(), pid, "encfs mount discovered");
        self.mounts.push(EncfsMount {
            front,
            back,
            pid,
            pending_removal: false,
        });
    }

    /// Drops every inode-cache entry whose path lies under `back`.
    fn forget_back_path(&mut self, back: &Path) {
        self.inode_cache
            .retain(|_, path| !is_component_prefix(back, path));
    }

    /// Rescans the mount table, at most once per wall-clock second, and
    /// only when `probe` lives on a FUSE filesystem at all.
    pub fn refresh_if_stale(&mut self, probe: &Path) {
        let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) else {
            return;
        };
        let now = now.as_secs();
        if self.last_refresh_sec == Some(now) {
            return;
        }
        self.last_refresh_sec = Some(now);

        if !is_fuse_path(probe) {
            return;
        }
        if let Err(err) = self.force_refresh() {
            debug!(%err, "encfs mount table refresh failed");
        }
    }

    /// Maps `src` to the corresponding file on the EncFS backing store.
    ///
    /// Paths outside any known overlay come back unchanged, as does
    /// anything the resolver fails on: back-resolution is best-effort and
    /// the caller treats the result as an ordinary path.
    pub fn resolve(&mut self, src: &Path) -> PathBuf {
        if !is_fuse_path(src) {
            return src.to_path_buf();
        }

        for idx in 0..self.mounts.len() {
            let front = self.mounts[idx].front.clone();
            let back = self.mounts[idx].back.clone();
            if !is_component_prefix(&front, src) {
                continue;
            }
            trace!(src = %src.display(), front = %front.display(), "probing encfs mount");

            let Ok(meta) = fs::symlink_metadata(src) else {
                continue;
            };
            if !meta.file_type().is_file() {
                continue;
            }

            if let Some(cached) = self.inode_cache.get(&meta.ino()) {
                trace!(src = %src.display(), hit = %cached.display(), "inode cache hit");
                return cached.clone();
            }

            let Some(trace_inodes) = inode_trace(src, &front) else {
                continue;
            };
            if let Some(resolved) = self.follow_trace(&trace_inodes, &back) {
                debug!(src = %src.display(), resolved = %resolved.display(), "resolved encfs path");
                return resolved;
            }
        }

        src.to_path_buf()
    }

    /// Walks `trace` (deepest first) down from the backing root, matching
    /// each level by inode. A cached inode anywhere in the trace provides a
    /// head start at that depth.
    fn follow_trace(&mut self, trace: &[u64], back: &Path) -> Option<PathBuf> {
        let hit = trace
            .iter()
            .enumerate()
            .find_map(|(depth, ino)| self.inode_cache.get(ino).map(|p| (depth, p.clone())));

        let (mut level, mut cur) = match hit {
            // trace[depth] is already known; only the levels below remain.
            Some((depth, path)) => (depth.checked_sub(1), path),
            None => (Some(trace.len() - 1), back.to_path_buf()),
        };

        while let Some(depth) = level {
            cur = self.find_inode_in_dir(&cur, trace[depth])?;
            level = depth.checked_sub(1);
        }
        Some(cur)
    }

    /// Scans `dir` for a child with inode `target`, caching the inode→path
    /// of every listed child along the way. The bulk caching amortizes the
    /// scan across sibling lookups.
    fn find_inode_in_dir(&mut self, dir: &Path, target: u64) -> Option<PathBuf> {
        let entries = match dirents::list_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), %err, "cannot scan backing directory");
                return None;
            }
        };

        let mut found = None;
        for entry in entries {
            if entry.is_dot() {
                continue;
            }
            let child = dir.join(&entry.name);
            if entry.ino == target && found.is_none() {
                found = Some(child.clone());
            }
            self.inode_cache.entry(entry.ino).or_insert(child);
        }
        found
    }

    /// Forgets every mount and cached inode.
    pub fn clear(&mut self) {
        self.mounts.clear();
        self.inode_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_parsing_extracts_back_and_front() {
        let cmdline = b"encfs\0--standard\0/var/.enc/\0/mnt/enc\0".to_vec();
        let (back, front) = parse_encfs_cmdline(&cmdline).unwrap();
        assert_eq!(back, PathBuf::from("/var/.enc"));
        assert_eq!(front, PathBuf::from("/mnt/enc"));
    }

    #[test]
    fn cmdline_parsing_rejects_other_programs_and_short_argv() {
        assert!(parse_encfs_cmdline(b"encfs2\0/a\0/b\0").is_none());
        assert!(parse_encfs_cmdline(b"/usr/bin/encfs\0/a\0/b\0").is_none());
        assert!(parse_encfs_cmdline(b"encfs\0/only-back\0").is_none());
        assert!(parse_encfs_cmdline(b"encfs\0-f\0--public\0").is_none());
        assert!(parse_encfs_cmdline(b"").is_none());
    }

    #[test]
    fn component_prefix_requires_a_boundary() {
        let front = Path::new("/mnt/enc");
        assert!(is_component_prefix(front, Path::new("/mnt/enc")));
        assert!(is_component_prefix(front, Path::new("/mnt/enc/a/b")));
        assert!(!is_component_prefix(front, Path::new("/mnt/encrypted/a")));
        assert!(!is_component_prefix(front, Path::new("/mnt")));
    }

    #[test]
    fn inode_trace_walks_deepest_first() {
        let root = tempfile::tempdir().unwrap();
        let sub = root.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let file = sub.join("file");
        std::fs::write(&file, b"payload").unwrap();

        let trace = inode_trace(&file, root.path()).unwrap();
        let file_ino = fs::symlink_metadata(&file).unwrap().ino();
        let sub_ino = fs::symlink_metadata(&sub).unwrap().ino();
        assert_eq!(trace, vec![file_ino, sub_ino]);
    }

    #[test]
    fn inode_trace_fails_outside_the_front() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("sub").join("gone");
        assert!(inode_trace(&missing, root.path()).is_none());
    }

    #[test]
    fn follow_trace_finds_children_by_inode_and_caches_siblings() {
        // The "back" tree here is the same real tree the trace was built
        // from, which is exactly the inode correspondence EncFS provides.
        let root = tempfile::tempdir().unwrap();
        let sub = root.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let file = sub.join("file");
        std::fs::write(&file, b"payload").unwrap();
        let sibling = sub.join("sibling");
        std::fs::write(&sibling, b"x").unwrap();

        let trace = inode_trace(&file, root.path()).unwrap();
        let mut resolver = Resolver::new();
        let resolved = resolver.follow_trace(&trace, root.path()).unwrap();
        assert_eq!(resolved, file);

        // Every listed child was cached, verifiably.
        let sibling_ino = fs::symlink_metadata(&sibling).unwrap().ino();
        assert_eq!(resolver.inode_cache.get(&sibling_ino), Some(&sibling));
        for (ino, path) in &resolver.inode_cache {
            assert_eq!(fs::symlink_metadata(path).unwrap().ino(), *ino);
        }
    }

    #[test]
    fn forgetting_a_back_path_drops_only_its_entries() {
        let mut resolver = Resolver::new();
        resolver
            .inode_cache
            .insert(1, PathBuf::from("/var/.enc/a"));
        resolver
            .inode_cache
            .insert(2, PathBuf::from("/var/.enc-other/b"));
        resolver.forget_back_path(Path::new("/var/.enc"));
        assert!(!resolver.inode_cache.contains_key(&1));
        assert!(resolver.inode_cache.contains_key(&2));
    }

    #[test]
    fn remount_with_new_pid_replaces_and_invalidates() {
        let mut resolver = Resolver::new();
        resolver.record_mount(10, PathBuf::from("/var/.enc"), PathBuf::from("/mnt/enc"));
        resolver
            .inode_cache
            .insert(7, PathBuf::from("/var/.enc/x"));

        // Same pid: mapping and cache survive.
        resolver.record_mount(10, PathBuf::from("/var/.enc"), PathBuf::from("/mnt/enc"));
        assert!(resolver.inode_cache.contains_key(&7));

        // New pid on the same front: old backing entries are dropped.
        resolver.record_mount(11, PathBuf::from("/var/.enc2"), PathBuf::from("/mnt/enc"));
        assert_eq!(resolver.mounts.len(), 1);
        assert_eq!(resolver.mounts[0].back, PathBuf::from("/var/.enc2"));
        assert!(!resolver.inode_cache.contains_key(&7));
    }
}
