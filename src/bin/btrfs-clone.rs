use btrfs_clone::core::plan::Strategy;
use btrfs_clone::core::{self, CloneConfig};
use clap::{crate_version, Clap};
use log::*;
use std::path::PathBuf;

fn main() {
    let options: CliOptions = CliOptions::parse();
    let level = match options.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    pretty_env_logger::formatted_builder().filter_level(level).init();

    debug!("Debug verbosity enabled.");
    trace!("Trace verbosity enabled.");

    let config = CloneConfig {
        old: options.old,
        new: options.new,
        btrfs_command: options.btrfs.into(),
        verbosity: options.verbose.max(0) as u8,
        dry_run: options.dry_run,
        force: options.force,
        strategy: options.strategy,
        snap_base: options.snap_base,
        keep_toplevel: options.toplevel,
    };

    if let Err(error) = core::run(&config) {
        error!("{:#}", error);
        if config.verbosity >= 2 {
            info!("Send/receive details are kept in btrfs-send-*.log.gz and btrfs-recv-*.log.gz.");
        }
        std::process::exit(1);
    }
}

/// Clones a btrfs filesystem onto another one, subvolume by subvolume,
/// through btrfs send/receive.
#[derive(Clap)]
#[clap(version = crate_version!(), author = "rebeagle")]
struct CliOptions {
    /// Enable debug logs and command echo. Use twice to also capture
    /// send/receive stderr into gzip log files.
    #[clap(short, long, parse(from_occurrences))]
    verbose: i32,

    /// Path of the btrfs utility.
    #[clap(short = "B", long = "btrfs", default_value = "btrfs")]
    btrfs: String,

    /// Compute and log the full plan without modifying either filesystem.
    #[clap(short = "n", long)]
    dry_run: bool,

    /// Continue even if both filesystems report the same uuid.
    #[clap(long)]
    force: bool,

    /// Replication strategy: parent (original genealogy) or snapshot
    /// (adjacent-sibling deltas).
    #[clap(short = "s", long, default_value = "snapshot")]
    strategy: Strategy,

    /// Fixed name for the destination staging directory. [default: random]
    #[clap(long)]
    snap_base: Option<String>,

    /// Keep the cloned top level as a subvolume in the destination instead of
    /// merging its contents into the destination root.
    #[clap(short = "t", long)]
    toplevel: bool,

    /// Mount point of the existing filesystem.
    old: PathBuf,

    /// Mount point of the new filesystem.
    new: PathBuf,
}
