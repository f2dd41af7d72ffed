pub mod place;
pub mod plan;
pub mod toplevel;
pub mod transfer;

use crate::btrfs::Btrfs;
use crate::error::CloneError;
use crate::filesystem::{lookup_mountentry, random_name, BtrfsMountEntry, TempMount};
use crate::inventory::{set_all_ro, Inventory};
use anyhow::{anyhow, Context, Result};
use log::*;
use plan::{Staging, Strategy};
use std::convert::TryFrom;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use transfer::LogPolicy;
use uuid::Uuid;

/// Run configuration, assembled by the binary from the command line. Passed
/// explicitly; nothing here is process-global.
#[derive(Debug, Clone)]
pub struct CloneConfig {
    /// Mount point of the filesystem to clone.
    pub old: PathBuf,
    /// Mount point of the filesystem to clone onto.
    pub new: PathBuf,
    pub btrfs_command: OsString,
    pub verbosity: u8,
    pub dry_run: bool,
    pub force: bool,
    pub strategy: Strategy,
    /// Fixed staging directory name; random when absent.
    pub snap_base: Option<String>,
    /// Keep the cloned top level as a subvolume instead of merging it.
    pub keep_toplevel: bool,
}

/// LIFO stack of labeled exit actions. Actions registered while the run
/// progresses are executed in reverse order on every exit path; the stack
/// also unwinds on drop so early returns and panics are covered. Failures
/// are reported and swallowed, never changing the outcome of the run.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, Box<dyn FnOnce() -> Result<()>>)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer<F>(&mut self, label: &str, action: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.actions.push((label.to_string(), Box::new(action)));
    }

    pub fn unwind(&mut self) {
        while let Some((label, action)) = self.actions.pop() {
            debug!("Cleanup: {}.", label);
            if let Err(error) = action() {
                warn!(
                    "{}",
                    CloneError::CleanupFailed {
                        action: label,
                        reason: format!("{:#}", error),
                    }
                );
            }
        }
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        self.unwind();
    }
}

/// Clones the filesystem mounted at `config.old` onto the one mounted at
/// `config.new`: inventory, read-only lock, top-level transfer, subvolume
/// replication, final placement, cleanup.
pub fn run(config: &CloneConfig) -> Result<()> {
    check_mountpoint(&config.old, "source")?;
    check_mountpoint(&config.new, "destination")?;

    let btrfs = Btrfs::new(config.btrfs_command.clone(), config.dry_run);
    let policy = LogPolicy::for_verbosity(config.verbosity);

    let source_uuid = btrfs
        .filesystem_uuid(&config.old)
        .context("Failed to identify the source filesystem.")?;
    let dest_uuid = btrfs
        .filesystem_uuid(&config.new)
        .context("Failed to identify the destination filesystem.")?;
    ensure_distinct_filesystems(source_uuid, dest_uuid, config.force)?;
    info!("Cloning filesystem {} onto {}.", source_uuid, dest_uuid);

    let mut cleanup = CleanupStack::new();

    let source_mount = TempMount::fstree(&source_uuid)?;
    cleanup.defer("unmount the source fstree", {
        let path = source_mount.path.clone();
        move || TempMount::release(&path)
    });
    let dest_mount = TempMount::fstree(&dest_uuid)?;
    cleanup.defer("unmount the destination fstree", {
        let path = dest_mount.path.clone();
        move || TempMount::release(&path)
    });

    let inventory = Inventory::scan(&btrfs, &source_mount.path)?;
    info!("Found {} subvolumes on the source filesystem.", inventory.len());

    set_all_ro(&btrfs, &inventory, &source_mount.path, true)?;
    cleanup.defer("restore subvolume read-only properties", {
        let btrfs = btrfs.clone();
        let inventory = inventory.clone();
        let mount = source_mount.path.clone();
        move || set_all_ro(&btrfs, &inventory, &mount, false)
    });

    let dest_root = toplevel::replicate_toplevel(
        &btrfs,
        &mut cleanup,
        &source_mount.path,
        &dest_mount.path,
        config.keep_toplevel,
        policy,
    )?;

    let staging_name = config.snap_base.clone().unwrap_or_else(|| random_name(12));
    let staging = Staging::new(dest_root.join(staging_name));
    if config.strategy == Strategy::Snapshot {
        prepare_staging(&staging, config.dry_run, &mut cleanup)?;
    }

    let jobs = plan::plan(&inventory, config.strategy, &source_mount.path, &dest_root, &staging);
    info!(
        "Replicating {} subvolumes with the {} strategy.",
        jobs.len(),
        config.strategy
    );
    transfer::execute_jobs(&btrfs, &jobs, policy)?;

    if config.strategy == Strategy::Snapshot {
        place::place_subvolumes(&btrfs, &inventory, &dest_root, &staging)?;
    }

    cleanup.unwind();
    info!("Clone complete.");
    Ok(())
}

/// Cloning a filesystem onto itself would be destructive; an identical uuid
/// aborts the run before anything is mounted or modified unless the user
/// forces it.
fn ensure_distinct_filesystems(source: Uuid, dest: Uuid, force: bool) -> Result<()> {
    if source != dest {
        return Ok(());
    }
    let error = CloneError::SameFilesystem { uuid: source };
    if force {
        warn!("{}. Continuing because of --force.", error);
        Ok(())
    } else {
        Err(error.into())
    }
}

fn check_mountpoint(path: &Path, role: &str) -> Result<()> {
    let entry = lookup_mountentry(path)?
        .ok_or_else(|| anyhow!("The {} path {:?} is not a mount point.", role, path))?;
    let entry = BtrfsMountEntry::try_from(entry)?;
    if !entry.is_toplevel_subvolume() {
        debug!(
            "The {} mount {:?} is subvolume {:?}; the fstree will be remounted temporarily.",
            role,
            path,
            entry.subvolume_path().unwrap_or_default()
        );
    }
    Ok(())
}

fn prepare_staging(staging: &Staging, dry_run: bool, cleanup: &mut CleanupStack) -> Result<()> {
    if !staging.root().exists() {
        if dry_run {
            info!("Would create staging directory {:?}.", staging.root());
        } else {
            fs::create_dir(staging.root())
                .with_context(|| format!("Failed to create staging directory {:?}.", staging.root()))?;
        }
    }
    cleanup.defer("remove the staging directory", {
        let root = staging.root().to_path_buf();
        move || match fs::remove_dir(&root) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error).with_context(|| format!("Failed to remove {:?}.", root)),
        }
    });
    Ok(())
}
