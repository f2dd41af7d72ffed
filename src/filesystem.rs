use crate::process::run_checked;
use anyhow::{anyhow, Context, Result};
use log::*;
use mnt::{MountEntry, MountIter};
use rand::Rng;
use std::convert::TryFrom;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

pub fn lookup_mountentry(target: &Path) -> Result<Option<MountEntry>> {
    let iter = MountIter::new_from_proc().map_err(|e| anyhow!("Failed to open the system mount table: {:?}", e))?;
    for entry in iter {
        let entry = entry.map_err(|e| anyhow!("Failed to parse the system mount table: {:?}", e))?;
        if entry.file == target {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

#[derive(Debug)]
pub struct BtrfsMountEntry(MountEntry);

impl BtrfsMountEntry {
    pub fn mount_entry(&self) -> &MountEntry {
        &self.0
    }

    pub fn subvolume_id(&self) -> Option<u32> {
        self.keyed_option("subvolid")
    }

    pub fn subvolume_path(&self) -> Option<String> {
        self.keyed_option("subvol")
    }

    pub fn is_toplevel_subvolume(&self) -> bool {
        let subvol_id = self.subvolume_id();
        let subvol_path = self.subvolume_path();

        (subvol_id.is_none() && subvol_path.is_none())
            || subvol_id.unwrap_or_default() == 5
            || subvol_path.unwrap_or_default() == "/"
    }

    pub fn keyed_option<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Debug,
    {
        let prefix = format!("{}=", key);
        self.0
            .mntops
            .iter()
            .filter_map(|x| match x {
                mnt::MntOps::Extra(extra) if extra.starts_with(prefix.as_str()) => {
                    Some(extra.splitn(2, "=").nth(1).unwrap().parse::<T>().unwrap())
                }
                _ => None,
            })
            .next()
    }
}

impl TryFrom<MountEntry> for BtrfsMountEntry {
    type Error = anyhow::Error;

    fn try_from(other: MountEntry) -> Result<Self, Self::Error> {
        match other.vfstype.as_str() {
            "btrfs" => Ok(BtrfsMountEntry(other)),
            _ => Err(anyhow!("{} is not a btrfs mount.", other.file.to_string_lossy())),
        }
    }
}

/// A 12-character alphanumeric name for snapshots, staging directories and
/// temporary mount points.
pub fn random_name(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// A temporary mount of a filesystem's true root (subvolid 5). The caller may
/// have mounted any subvolume; cloning always works against the fstree.
#[derive(Debug)]
pub struct TempMount {
    pub path: PathBuf,
}

impl TempMount {
    pub fn fstree(uuid: &Uuid) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("btrfs-clone-{}", random_name(12)));
        fs::create_dir(&path).with_context(|| format!("Failed to create mount directory {:?}.", path))?;
        info!("Mounting fstree of {} at {:?}.", uuid, path);
        run_checked(duct_cmd!(
            "mount",
            "-o",
            "subvolid=5",
            format!("UUID={}", uuid),
            &path
        ))
        .with_context(|| format!("Failed to mount filesystem {}.", uuid))?;
        Ok(TempMount { path })
    }

    /// Lazy unmount followed by removal of the mount directory. Used from
    /// exit actions, so it takes the path rather than consuming a handle.
    pub fn release(path: &Path) -> Result<()> {
        run_checked(duct_cmd!("umount", "-l", path)).with_context(|| format!("Failed to unmount {:?}.", path))?;
        fs::remove_dir(path).with_context(|| format!("Failed to remove mount directory {:?}.", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_if_not_btrfs() {
        let non_btrfs_mount: MountEntry = "/dev/vda / ext4 rw 0 0".parse().unwrap();
        assert!(BtrfsMountEntry::try_from(non_btrfs_mount)
            .unwrap_err()
            .to_string()
            .contains("not a btrfs mount"))
    }

    #[test]
    fn no_subvol_options_is_toplevel() {
        let mount: MountEntry = "/dev/vda / btrfs rw,noatime 0 0".parse().unwrap();
        assert!(BtrfsMountEntry::try_from(mount).unwrap().is_toplevel_subvolume())
    }

    #[test]
    fn top_subvol_options_is_toplevel() {
        let mount: MountEntry = "/dev/vda / btrfs rw,noatime,subvolid=5,subvol=/ 0 0".parse().unwrap();
        assert!(BtrfsMountEntry::try_from(mount).unwrap().is_toplevel_subvolume())
    }

    #[test]
    fn child_subvol_options_is_not_toplevel() {
        let mount: MountEntry = "/dev/vda / btrfs rw,noatime,subvolid=257,subvol=/testsub 0 0"
            .parse()
            .unwrap();
        let mount = BtrfsMountEntry::try_from(mount).unwrap();
        assert!(!mount.is_toplevel_subvolume());
        assert_eq!(mount.subvolume_id().unwrap(), 257);
        assert_eq!(mount.subvolume_path().unwrap(), "/testsub");
    }

    #[test]
    fn random_names_are_alphanumeric_and_sized() {
        let name = random_name(12);
        assert_eq!(name.len(), 12);
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_name(12), random_name(12));
    }
}
