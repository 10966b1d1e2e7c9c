#![allow(dead_code)]

use std::path::{Path, PathBuf};

/// Creates `name` under `dir` with `len` bytes of repeating content.
pub fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, content).unwrap();
    path
}
