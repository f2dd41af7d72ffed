use crate::btrfs::Btrfs;
use crate::error::CloneError;
use anyhow::Result;
use log::*;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One subvolume of the source filesystem as inventoried at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Subvolume {
    pub id: u64,
    pub gen: u64,
    pub toplevel_id: u64,
    /// Path relative to the filesystem root.
    pub path: PathBuf,
    pub uuid: Uuid,
    /// Uuid of the subvolume this one is a snapshot of, if any.
    pub parent_uuid: Option<Uuid>,
    /// Id of the subvolume containing this one (5 for the top level).
    pub parent_id: u64,
    pub creation_gen: u64,
    /// Whether the subvolume was already read-only before this run.
    pub ro: bool,
}

impl Subvolume {
    pub fn path_under(&self, base: &Path) -> PathBuf {
        base.join(&self.path)
    }

    pub fn file_name(&self) -> &OsStr {
        self.path
            .file_name()
            .expect("inventoried subvolume paths always have a final component")
    }
}

/// All subvolumes of the source, ordered by ascending creation generation and
/// indexed by uuid for parent-chain lookups.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    subvols: Vec<Subvolume>,
    uuid_index: HashMap<Uuid, usize>,
}

impl Inventory {
    /// Builds the inventory of a mounted filesystem by listing it and running
    /// a `show` query per subvolume.
    pub fn scan(btrfs: &Btrfs, mount: &Path) -> Result<Self> {
        let mut subvols = Vec::new();
        for listed in btrfs.list_subvolumes(mount)? {
            let shown = btrfs.show_subvolume(&mount.join(&listed.path))?;
            if shown.id != listed.id {
                return Err(CloneError::InventoryInconsistent {
                    path: listed.path,
                    listed: listed.id,
                    shown: shown.id,
                }
                .into());
            }
            trace!("Inventoried subvolume {} at {:?}.", listed.id, listed.path);
            subvols.push(Subvolume {
                id: listed.id,
                gen: listed.gen,
                toplevel_id: listed.toplevel_id,
                path: listed.path,
                uuid: shown.uuid,
                parent_uuid: shown.parent_uuid,
                parent_id: shown.parent_id,
                creation_gen: shown.gen_at_creation,
                ro: shown.ro,
            });
        }
        Ok(Self::from_subvols(subvols))
    }

    pub fn from_subvols(mut subvols: Vec<Subvolume>) -> Self {
        subvols.sort_by_key(|sv| (sv.creation_gen, sv.id));
        let uuid_index = subvols
            .iter()
            .enumerate()
            .map(|(index, sv)| (sv.uuid, index))
            .collect();
        Self { subvols, uuid_index }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Subvolume> {
        self.subvols.iter()
    }

    pub fn len(&self) -> usize {
        self.subvols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subvols.is_empty()
    }

    pub fn by_uuid(&self, uuid: &Uuid) -> Option<&Subvolume> {
        self.uuid_index.get(uuid).map(|&index| &self.subvols[index])
    }
}

/// Applies `value` to the `ro` property of every subvolume that was writable
/// at inventory time; subvolumes that were already read-only belong to the
/// user and are never toggled.
///
/// Locking (true) iterates in inventory order and fails fast. Restoring
/// (false) iterates in reverse and keeps going past individual failures,
/// since restoration also runs on teardown of an already-failed run.
pub fn set_all_ro(btrfs: &Btrfs, inventory: &Inventory, mount: &Path, value: bool) -> Result<()> {
    if value {
        for subvol in inventory.iter().filter(|sv| !sv.ro) {
            btrfs.set_ro(&subvol.path_under(mount), true)?;
        }
    } else {
        for subvol in inventory.iter().rev().filter(|sv| !sv.ro) {
            if let Err(error) = btrfs.set_ro(&subvol.path_under(mount), false) {
                warn!("Could not restore read-write on {:?}: {:#}", subvol.path, error);
            }
        }
    }
    Ok(())
}
