//! Physical-order precache engine.
//!
//! Turns per-file random-access read patterns into disk-order sequential
//! reads that prime the kernel page cache: enumerate the physical extents
//! of a set of files, sort them globally by device position, stream them
//! back. When the consumer then reads the same files normally, the data
//! comes out of RAM instead of the disk head.
//!
//! The [`engine::Engine`] exposes the hook surface for an interposition
//! layer watching a host process; [`driver::Driver`] and
//! [`walker::walk_tree`] back the standalone CLI modes.

pub mod config;
pub mod dirents;
pub mod driver;
pub mod engine;
pub mod fiemap;
pub mod reader;
pub mod resolver;
pub mod segment;
pub mod tracker;
pub mod walker;

pub use config::Config;
pub use driver::{Driver, PrecacheStats, Precacher};
pub use engine::{DirToken, Engine, OpenAt, Readdir};
pub use resolver::Resolver;
pub use segment::{Segment, SegmentPool};
pub use tracker::{DirEntry, FsmState};
