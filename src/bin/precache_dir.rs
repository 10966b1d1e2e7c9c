//! Precache a directory tree by streaming its extents off the raw device.
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use precache_core::{walker, Resolver};

#[derive(Parser)]
#[command(
    version,
    about = "Walk a directory tree and stream its extents off the raw device in physical order."
)]
struct Args {
    /// Root of the tree to precache.
    #[arg(value_name = "ROOT")]
    root: PathBuf,

    /// Block device backing the tree. Guessed from /proc/mounts when
    /// omitted.
    #[arg(value_name = "RAW-DEVICE")]
    raw_device: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let device_path = match args.raw_device {
        Some(device) => device,
        None => match walker::guess_device_for_path(&args.root) {
            Some(device) => {
                println!(
                    "Raw device guessed by examining /proc/mounts: {}",
                    device.display()
                );
                device
            }
            None => {
                eprintln!(
                    "Error: can't determine the raw device behind {}",
                    args.root.display()
                );
                return ExitCode::from(1);
            }
        },
    };

    let device = match File::open(&device_path) {
        Ok(device) => device,
        Err(err) => {
            eprintln!(
                "Error: can't open raw device file {}: {err}",
                device_path.display()
            );
            return ExitCode::from(1);
        }
    };

    let mut resolver = Resolver::new();
    match walker::walk_tree(&mut resolver, &args.root, device) {
        Ok(stats) => {
            let mib = stats.bytes_read.div_ceil(1024 * 1024);
            println!("total data read: {mib} MiB ({} B)", stats.bytes_read);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(1)
        }
    }
}
