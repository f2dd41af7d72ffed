use crate::btrfs::Btrfs;
use crate::core::transfer::{self, LogPolicy};
use crate::core::CleanupStack;
use crate::filesystem::random_name;
use anyhow::{Context, Result};
use log::*;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Replicates the content of the source's top-level subvolume, which the
/// send protocol cannot transfer directly: a random-named read-only snapshot
/// of the source root is sent instead, then either merged into the
/// destination root (default) or kept as a subvolume (`-t`).
///
/// Returns the directory all further replication is relative to.
pub fn replicate_toplevel(
    btrfs: &Btrfs,
    cleanup: &mut CleanupStack,
    source_root: &Path,
    dest_root: &Path,
    keep_toplevel: bool,
    policy: LogPolicy,
) -> Result<PathBuf> {
    let name = random_name(12);
    let snapshot_path = source_root.join(&name);

    info!("Snapshotting the source top level as {:?}.", snapshot_path);
    btrfs.snapshot_ro(source_root, &snapshot_path)?;
    cleanup.defer("delete the source-side root snapshot", {
        let btrfs = btrfs.clone();
        let snapshot_path = snapshot_path.clone();
        move || btrfs.delete_subvolume(&snapshot_path)
    });

    transfer::send_receive(btrfs, &snapshot_path, dest_root, None, &[], policy)?;

    let received = dest_root.join(&name);
    btrfs.set_ro(&received, false)?;

    if keep_toplevel {
        info!("Keeping the cloned top level as subvolume {:?}.", received);
        return Ok(received);
    }

    merge_into_root(btrfs, &received, dest_root)?;
    Ok(dest_root.to_path_buf())
}

/// Moves every entry of the received snapshot that lives on the snapshot's
/// own device into the destination root, then deletes the emptied snapshot.
/// Entries on a different device are nested subvolumes; they are left behind
/// for the replication planner.
fn merge_into_root(btrfs: &Btrfs, received: &Path, dest_root: &Path) -> Result<()> {
    if btrfs.dry_run() {
        info!("Would merge the entries of {:?} into {:?}.", received, dest_root);
        return Ok(());
    }

    let top_device = fs::metadata(received)
        .with_context(|| format!("Failed to stat the received snapshot {:?}.", received))?
        .dev();
    let entries = fs::read_dir(received)
        .with_context(|| format!("Failed to list {:?}.", received))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to list {:?}.", received))?;
    for entry in entries {
        let metadata = entry
            .metadata()
            .with_context(|| format!("Failed to stat {:?}.", entry.path()))?;
        if metadata.dev() != top_device {
            debug!("Leaving nested subvolume {:?} for the planner.", entry.file_name());
            continue;
        }
        let target = dest_root.join(entry.file_name());
        fs::rename(entry.path(), &target)
            .with_context(|| format!("Failed to move {:?} to {:?}.", entry.path(), target))?;
    }
    btrfs.delete_subvolume(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::mocks::MockFakeCmd;
    use serial_test::serial;

    #[test]
    #[serial(fakecmd)]
    fn merge_moves_same_device_entries_and_deletes_the_snapshot() {
        // The delete at the end goes through the mocked command layer.
        let ctx = MockFakeCmd::data_context();
        ctx.expect().returning(String::new);

        let scratch = tempfile::tempdir().unwrap();
        let received = scratch.path().join("Jk3hYwQ92bXa");
        let dest_root = scratch.path().to_path_buf();
        fs::create_dir(&received).unwrap();
        fs::create_dir(received.join("etc")).unwrap();
        fs::write(received.join("etc").join("fstab"), "none / btrfs defaults 0 0\n").unwrap();
        fs::write(received.join("vmlinuz"), "kernel").unwrap();

        let btrfs = Btrfs::new("btrfs", false);
        merge_into_root(&btrfs, &received, &dest_root).unwrap();

        assert!(dest_root.join("etc").join("fstab").exists());
        assert!(dest_root.join("vmlinuz").exists());
        assert!(!received.join("etc").exists());
        assert!(!received.join("vmlinuz").exists());
    }

    #[test]
    fn dry_run_merge_leaves_everything_alone() {
        let scratch = tempfile::tempdir().unwrap();
        let received = scratch.path().join("Jk3hYwQ92bXa");
        fs::create_dir(&received).unwrap();
        fs::write(received.join("vmlinuz"), "kernel").unwrap();

        let btrfs = Btrfs::new("btrfs", true);
        merge_into_root(&btrfs, &received, scratch.path()).unwrap();
        assert!(received.join("vmlinuz").exists());
    }
}
