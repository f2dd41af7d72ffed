use crate::btrfs::{Btrfs, TOPLEVEL_ID};
use crate::core::plan::Staging;
use crate::error::CloneError;
use crate::inventory::{Inventory, Subvolume};
use anyhow::{bail, Context, Result};
use log::*;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Moves every staged subvolume from `<staging>/<id>/<basename>` to its final
/// path under the destination root. Containers are processed before their
/// contents; a subvolume whose container is missing is reported and the sweep
/// continues, but the run as a whole fails.
///
/// The move must be a rename: receive produced a subvolume, not a plain
/// directory, and only a rename preserves that identity.
pub fn place_subvolumes(
    btrfs: &Btrfs,
    inventory: &Inventory,
    dest_root: &Path,
    staging: &Staging,
) -> Result<()> {
    let mut order: Vec<&Subvolume> = inventory.iter().collect();
    order.sort_by_key(|sv| (sv.parent_id, sv.id));

    let mut placed: HashSet<u64> = HashSet::new();
    let mut failures = 0usize;

    for subvol in order {
        let staged = staging.path_for(subvol);
        let goal = dest_root.join(&subvol.path);

        if btrfs.dry_run() {
            info!("Would move {:?} to {:?}.", staged, goal);
            placed.insert(subvol.id);
            continue;
        }

        if !staged.exists() {
            if goal.exists() {
                debug!("Subvolume {} is already in place at {:?}.", subvol.id, goal);
                placed.insert(subvol.id);
            } else {
                error!(
                    "Subvolume {} is neither staged at {:?} nor placed at {:?}.",
                    subvol.id, staged, goal
                );
                failures += 1;
            }
            continue;
        }

        if subvol.parent_id != TOPLEVEL_ID && !placed.contains(&subvol.parent_id) {
            error!(
                "{}",
                CloneError::PlacementFailed {
                    path: subvol.path.clone(),
                    parent_id: subvol.parent_id,
                }
            );
            failures += 1;
            continue;
        }

        move_into_place(btrfs, subvol, &staged, &goal)?;
        placed.insert(subvol.id);

        let staged_dir = staging.dir_for(subvol.id);
        if let Err(error) = fs::remove_dir(&staged_dir) {
            debug!("Could not remove staging directory {:?}: {}.", staged_dir, error);
        }
    }

    if !btrfs.dry_run() {
        if let Err(error) = fs::remove_dir(staging.root()) {
            info!("Staging root {:?} not removed: {}.", staging.root(), error);
        }
    }

    if failures > 0 {
        bail!("{} subvolume(s) could not be moved to their final location.", failures);
    }
    Ok(())
}

/// Renames one staged subvolume to its goal path. Read-only subvolumes are
/// briefly made writable for the rename; restoring the flag afterwards is
/// best-effort.
fn move_into_place(btrfs: &Btrfs, subvol: &Subvolume, staged: &Path, goal: &Path) -> Result<()> {
    debug!("Moving {:?} to {:?}.", staged, goal);
    if subvol.ro {
        btrfs.set_ro(staged, false)?;
    }
    fs::rename(staged, goal).with_context(|| format!("Failed to move {:?} into place at {:?}.", staged, goal))?;
    if subvol.ro {
        if let Err(error) = btrfs.set_ro(goal, true) {
            warn!("Could not restore read-only on {:?}: {:#}", goal, error);
        }
    }
    Ok(())
}
