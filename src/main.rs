//! Precache explicit files in physical disk order.
use std::io::{BufRead as _, IsTerminal as _};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use precache_core::{Driver, Resolver};
use tracing::debug;

#[derive(Parser)]
#[command(
    version,
    about = "Prime the page cache with files read in physical disk order."
)]
struct Args {
    /// Files to precache. With no arguments and a non-tty stdin, paths
    /// are read from stdin, one per line.
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

fn files_from_stdin() -> Vec<PathBuf> {
    let stdin = std::io::stdin();
    let mut files = Vec::new();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) if line.is_empty() => {}
            Ok(line) => files.push(PathBuf::from(line)),
            Err(err) => {
                debug!(%err, "stopped reading the stdin file list");
                break;
            }
        }
    }
    files
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let mut files = args.files;
    if files.is_empty() && !std::io::stdin().is_terminal() {
        files = files_from_stdin();
    }
    if files.is_empty() {
        eprintln!("Usage: precache <file>...");
        return ExitCode::from(2);
    }

    let mut resolver = Resolver::new();
    if let Err(err) = resolver.force_refresh() {
        debug!(%err, "encfs mount scan failed; resolving paths as-is");
    }

    let stats = Driver::from_env().precache(&mut resolver, &files);
    println!(
        "precached {} of {} files ({} segments, {} B read)",
        stats.files_queued,
        files.len(),
        stats.segments,
        stats.bytes_read
    );
    ExitCode::SUCCESS
}
