//! Bulk-copy detection over interleaved readdir/open events.
//!
//! Copy tools iterate a directory as `readdir, open, readdir, open, …`.
//! A small per-handle state machine watches for that interleave and fires
//! a precache of the rest of the listing at the third open, before the
//! tool gets there file by file.

use std::ffi::OsString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Progress of the readdir/open interleave heuristic for one directory
/// handle. `DoPrecache` and `Skip` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Start,
    /// One readdir seen.
    R1O0,
    /// One readdir, one open.
    R1O1,
    /// Two readdirs, one open.
    R2O1,
    /// Two readdirs, two opens.
    R2O2,
    /// Three readdirs, two opens; the next open triggers.
    R3O2,
    /// Interleave confirmed; precaching decided.
    DoPrecache,
    /// Access pattern ruled out; never precache this handle.
    Skip,
}

impl FsmState {
    /// Transition on a readdir that returned a real (non-dot) entry.
    #[must_use]
    pub fn on_readdir(self) -> Self {
        match self {
            Self::Start => Self::R1O0,
            Self::R1O1 => Self::R2O1,
            Self::R2O2 => Self::R3O2,
            Self::R1O0 | Self::R2O1 | Self::R3O2 => Self::Skip,
            absorbing @ (Self::DoPrecache | Self::Skip) => absorbing,
        }
    }

    /// Transition on an open of a direct child of the directory.
    #[must_use]
    pub fn on_open(self) -> Self {
        match self {
            Self::R1O0 => Self::R1O1,
            Self::R2O1 => Self::R2O2,
            Self::R3O2 => Self::DoPrecache,
            Self::Start | Self::R1O1 | Self::R2O2 => Self::Skip,
            absorbing @ (Self::DoPrecache | Self::Skip) => absorbing,
        }
    }
}

/// A directory entry captured at opendir time, in the 64-bit form. The
/// interposition layer adapts whatever dirent layout it intercepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: OsString,
}

impl DirEntry {
    /// True for the `.` and `..` entries, which neither drive the state
    /// machine nor consume the cached-files window.
    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Per-open-directory state: the buffered listing, a serve cursor, the
/// FSM, and the count of already-precached entries still to be handed out.
///
/// The whole directory is drained into `entries` at opendir time, so that
/// when precaching triggers mid-iteration the not-yet-returned tail is
/// known without re-reading the directory.
#[derive(Debug)]
pub struct DirTracker {
    dirname: PathBuf,
    entries: Vec<DirEntry>,
    /// Index of the next entry to serve.
    cursor: usize,
    cached_files_remaining: usize,
    state: FsmState,
}

impl DirTracker {
    #[must_use]
    pub fn new(dirname: PathBuf, entries: Vec<DirEntry>) -> Self {
        Self {
            dirname,
            entries,
            cursor: 0,
            cached_files_remaining: 0,
            state: FsmState::Start,
        }
    }

    #[must_use]
    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    #[must_use]
    pub fn state(&self) -> FsmState {
        self.state
    }

    /// Serves the next buffered dirent. A real entry drives the FSM and
    /// consumes one slot of the cached window; dot entries pass through
    /// untouched. `None` means the buffer is exhausted.
    pub fn next_dirent(&mut self) -> Option<DirEntry> {
        let entry = self.entries.get(self.cursor)?.clone();
        self.cursor += 1;
        if !entry.is_dot() {
            if self.cached_files_remaining > 0 {
                self.cached_files_remaining -= 1;
            }
            self.state = self.state.on_readdir();
        }
        Some(entry)
    }

    /// Records an open of a direct child. True when this open is the
    /// trigger: the FSM just entered `DoPrecache` and no cached window is
    /// active.
    pub fn note_open(&mut self) -> bool {
        let before = self.state;
        self.state = self.state.on_open();
        self.state == FsmState::DoPrecache
            && before != FsmState::DoPrecache
            && self.cached_files_remaining == 0
    }

    /// The tail of the listing from the entry currently being processed
    /// (the one most recently served) through the end.
    #[must_use]
    pub fn remaining_from_current(&self) -> &[DirEntry] {
        &self.entries[self.cursor.saturating_sub(1)..]
    }

    pub fn set_cached_window(&mut self, queued: usize) {
        self.cached_files_remaining = queued;
    }

    /// Rewinding is equivalent to a fresh opendir: the cursor returns to
    /// the head of the buffer and the heuristic starts over.
    pub fn rewind(&mut self) {
        self.state = FsmState::Start;
        self.cursor = 0;
    }
}

/// True when `path` names a direct child of `dirname`: it extends the
/// directory by exactly one component.
pub(crate) fn opens_direct_child(dirname: &Path, path: &Path) -> bool {
    let dir = dirname.as_os_str().as_bytes();
    let path = path.as_os_str().as_bytes();
    path.len() > dir.len() + 1
        && &path[..dir.len()] == dir
        && path[dir.len()] == b'/'
        && !path[dir.len() + 1..].contains(&b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> DirEntry {
        DirEntry {
            ino: 1,
            name: OsString::from(name),
        }
    }

    #[test]
    fn interleave_reaches_do_precache_on_the_third_open() {
        let mut state = FsmState::Start;
        for _ in 0..2 {
            state = state.on_readdir();
            state = state.on_open();
        }
        state = state.on_readdir();
        assert_eq!(state, FsmState::R3O2);
        state = state.on_open();
        assert_eq!(state, FsmState::DoPrecache);
    }

    #[test]
    fn two_consecutive_readdirs_skip() {
        let state = FsmState::Start.on_readdir().on_readdir();
        assert_eq!(state, FsmState::Skip);
        // Skip absorbs everything after.
        assert_eq!(state.on_open(), FsmState::Skip);
        assert_eq!(state.on_readdir(), FsmState::Skip);
    }

    #[test]
    fn open_before_any_readdir_skips() {
        assert_eq!(FsmState::Start.on_open(), FsmState::Skip);
    }

    #[test]
    fn replaying_a_sequence_is_deterministic() {
        let replay = || {
            let mut state = FsmState::Start;
            for step in ["r", "o", "r", "o", "r", "o", "r"] {
                state = match step {
                    "r" => state.on_readdir(),
                    _ => state.on_open(),
                };
            }
            state
        };
        assert_eq!(replay(), replay());
        assert_eq!(replay(), FsmState::DoPrecache);
    }

    #[test]
    fn dot_entries_do_not_drive_the_tracker() {
        let mut tracker = DirTracker::new(
            PathBuf::from("/d"),
            vec![entry("."), entry(".."), entry("a")],
        );
        assert_eq!(tracker.next_dirent().unwrap().name, ".");
        assert_eq!(tracker.state(), FsmState::Start);
        assert_eq!(tracker.next_dirent().unwrap().name, "..");
        assert_eq!(tracker.state(), FsmState::Start);
        assert_eq!(tracker.next_dirent().unwrap().name, "a");
        assert_eq!(tracker.state(), FsmState::R1O0);
        assert!(tracker.next_dirent().is_none());
    }

    #[test]
    fn rewind_restarts_the_buffer_and_the_fsm() {
        let mut tracker = DirTracker::new(PathBuf::from("/d"), vec![entry("a"), entry("b")]);
        tracker.next_dirent();
        tracker.next_dirent();
        assert_eq!(tracker.state(), FsmState::Skip);
        tracker.rewind();
        assert_eq!(tracker.state(), FsmState::Start);
        assert_eq!(tracker.next_dirent().unwrap().name, "a");
    }

    #[test]
    fn direct_child_matching() {
        let dir = Path::new("/data/in");
        assert!(opens_direct_child(dir, Path::new("/data/in/file")));
        assert!(!opens_direct_child(dir, Path::new("/data/in/sub/file")));
        assert!(!opens_direct_child(dir, Path::new("/data/inbox/file")));
        assert!(!opens_direct_child(dir, Path::new("/data/in")));
        assert!(!opens_direct_child(dir, Path::new("/data/in/")));
        assert!(!opens_direct_child(dir, Path::new("/elsewhere/file")));
    }
}
