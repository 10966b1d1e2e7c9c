//! Environment configuration for precache events.
//!
//! Two knobs, both read from the environment once per process on first
//! use: `PRECACHE_LIMIT` caps the cumulative size of files queued per
//! event, `PRECACHE_SYNC=0` disables the pre-event flush of dirty pages.

use std::ffi::OsStr;
use std::sync::OnceLock;

use tracing::warn;

/// Default per-event budget: 1 GiB of file data.
pub const DEFAULT_BYTE_BUDGET: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on the cumulative `st_size` of files queued per event.
    pub byte_budget: u64,
    /// Whether to flush dirty pages system-wide before reading.
    pub sync_first: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            byte_budget: DEFAULT_BYTE_BUDGET,
            sync_first: true,
        }
    }
}

fn parse_budget(raw: Option<&OsStr>) -> Option<u64> {
    raw?.to_str()?.trim().parse().ok()
}

/// `0` disables the sync, any other integer enables it.
fn parse_sync(raw: Option<&OsStr>) -> Option<bool> {
    raw?.to_str()?.trim().parse::<i64>().ok().map(|v| v != 0)
}

impl Config {
    /// Builds a config from `PRECACHE_LIMIT` and `PRECACHE_SYNC`.
    /// Unparseable values keep the defaults, with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(raw) = std::env::var_os("PRECACHE_LIMIT") {
            match parse_budget(Some(raw.as_os_str())) {
                Some(bytes) => config.byte_budget = bytes,
                None => warn!(?raw, "ignoring unparseable PRECACHE_LIMIT"),
            }
        }

        if let Some(raw) = std::env::var_os("PRECACHE_SYNC") {
            match parse_sync(Some(raw.as_os_str())) {
                Some(enabled) => config.sync_first = enabled,
                None => warn!(?raw, "ignoring unparseable PRECACHE_SYNC"),
            }
        }

        config
    }

    /// Process-wide configuration, resolved from the environment on the
    /// first precache event and fixed for the lifetime of the process.
    #[must_use]
    pub fn get() -> Self {
        static CONFIG: OnceLock<Config> = OnceLock::new();
        *CONFIG.get_or_init(Self::from_env)
    }
}
