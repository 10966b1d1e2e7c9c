//! Process-wide engine state and the hook surface for the interposition
//! layer.
//!
//! The interposed entry points may be called concurrently by the host
//! process, so the mount table, the inode cache and the per-handle
//! tracker map all live behind one mutex, taken at the entry of every
//! handler and dropped on return. Extent and read I/O happens inside the
//! critical section; the expected trigger is a single-threaded copy tool.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::driver::{Driver, Precacher};
use crate::resolver::Resolver;
use crate::tracker::{opens_direct_child, DirEntry, DirTracker, FsmState};

/// Opaque identifier for an open directory stream. The interposition
/// layer passes the `DIR*` pointer value.
pub type DirToken = usize;

/// Location argument of an intercepted `openat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAt {
    /// Path relative to the current working directory (`AT_FDCWD`).
    Cwd,
    /// Path relative to an open directory descriptor.
    Fd(i32),
}

/// Result of dispatching a readdir hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readdir {
    /// The stream is tracked: serve this entry, `None` meaning end of
    /// stream.
    Served(Option<DirEntry>),
    /// The stream is unknown to the engine; the caller falls through to
    /// the real readdir.
    Untracked,
}

struct EngineState {
    resolver: Resolver,
    /// Registration order decides which handle an open is attributed to.
    trackers: Vec<(DirToken, DirTracker)>,
}

/// Owner of all process-wide precache state.
///
/// Handlers are plain synchronous functions over the event stream, so a
/// test harness can drive them with synthetic events exactly like the
/// interposition glue does with intercepted ones.
pub struct Engine {
    state: Mutex<EngineState>,
    precacher: Box<dyn Precacher + Send + Sync>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine wired to the real driver, configured from the environment.
    #[must_use]
    pub fn new() -> Self {
        Self::with_precacher(Box::new(Driver::from_env()))
    }

    /// Engine with a caller-supplied precache implementation.
    #[must_use]
    pub fn with_precacher(precacher: Box<dyn Precacher + Send + Sync>) -> Self {
        Self {
            state: Mutex::new(EngineState {
                resolver: Resolver::new(),
                trackers: Vec::new(),
            }),
            precacher,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().expect("engine mutex poisoned")
    }

    /// Registers a freshly opened directory stream with its pre-drained
    /// entries and opportunistically refreshes the EncFS mount table.
    pub fn handle_opendir(&self, token: DirToken, dirname: &Path, entries: Vec<DirEntry>) {
        let mut state = self.lock();
        state.resolver.refresh_if_stale(dirname);

        // A leftover record for this token means the stream was closed
        // behind our back; replace it.
        if state.trackers.iter().any(|(t, _)| *t == token) {
            debug!(token, "stale tracker for reused directory handle");
            state.trackers.retain(|(t, _)| *t != token);
        }
        state
            .trackers
            .push((token, DirTracker::new(dirname.to_path_buf(), entries)));
    }

    /// Serves the next buffered dirent for `token`.
    pub fn handle_readdir(&self, token: DirToken) -> Readdir {
        let mut state = self.lock();
        match state.trackers.iter_mut().find(|(t, _)| *t == token) {
            Some((_, tracker)) => Readdir::Served(tracker.next_dirent()),
            None => Readdir::Untracked,
        }
    }

    /// Notes an intercepted open. An open of a direct child of a tracked
    /// directory advances that directory's FSM (first matching handle in
    /// registration order only) and, on the trigger transition, precaches
    /// the rest of the directory listing.
    pub fn handle_open(&self, at: OpenAt, path: &Path) {
        if at != OpenAt::Cwd {
            // TODO: attribute dirfd-relative opens once the glue reports
            // the directory behind the descriptor.
            return;
        }

        let mut guard = self.lock();
        let EngineState { resolver, trackers } = &mut *guard;
        let Some((_, tracker)) = trackers
            .iter_mut()
            .find(|(_, t)| opens_direct_child(t.dirname(), path))
        else {
            return;
        };
        if !tracker.note_open() {
            return;
        }

        let dirname = tracker.dirname().to_path_buf();
        let paths: Vec<PathBuf> = tracker
            .remaining_from_current()
            .iter()
            .filter(|entry| !entry.is_dot())
            .map(|entry| dirname.join(&entry.name))
            .collect();
        debug!(dir = %dirname.display(), candidates = paths.len(), "copy pattern detected");
        let queued = self.precacher.precache_paths(resolver, &paths);
        tracker.set_cached_window(queued);
    }

    /// Drops the tracker for a closed directory stream.
    pub fn handle_closedir(&self, token: DirToken) {
        self.lock().trackers.retain(|(t, _)| *t != token);
    }

    /// Resets a stream to the head of its buffered listing, restarting the
    /// heuristic exactly as a fresh opendir would.
    pub fn handle_rewinddir(&self, token: DirToken) {
        if let Some((_, tracker)) = self
            .lock()
            .trackers
            .iter_mut()
            .find(|(t, _)| *t == token)
        {
            tracker.rewind();
        }
    }

    /// Unconditional EncFS mount table rescan.
    pub fn force_refresh(&self) {
        if let Err(err) = self.lock().resolver.force_refresh() {
            debug!(%err, "encfs mount table refresh failed");
        }
    }

    /// Current FSM state of a tracked stream, if any.
    #[must_use]
    pub fn fsm_state(&self, token: DirToken) -> Option<FsmState> {
        self.lock()
            .trackers
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, tracker)| tracker.state())
    }

    /// Drains every tracker and both caches. Called from the library
    /// unload path; a later event stream starts from scratch.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.trackers.clear();
        state.resolver.clear();
    }
}
