use crate::error::CloneError;
use crate::parsing::{parse_key_value_pair_lines, show_block_pairs, table_row_fields, StringPair};
use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use log::*;
use regex::Regex;
use serde::Deserialize;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;
use uuid::Uuid;

/// Id of the implicit top-level subvolume containing a filesystem's root
/// directory. It cannot be sent or snapshotted by id.
pub const TOPLEVEL_ID: u64 = 5;

macro_rules! btrfs_cmd {
    ( $self_:expr, $( $arg:expr ),+ ) => {
        crate::process::read_checked(duct_cmd!($self_.program(), $($arg),+))
    };
}

/// Wrapper around the external `btrfs` utility. Mutating operations honor
/// dry-run by logging the suppressed command; queries always execute.
#[derive(Debug, Clone)]
pub struct Btrfs {
    program: OsString,
    dry_run: bool,
}

/// One row of `btrfs subvolume list -t --sort=ogen`.
#[derive(Debug, Clone, PartialEq)]
pub struct ListedSubvolume {
    pub id: u64,
    pub gen: u64,
    pub toplevel_id: u64,
    pub path: PathBuf,
}

/// The attributes of `btrfs subvolume show` this tool relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct SubvolumeShow {
    pub id: u64,
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub parent_id: u64,
    pub gen_at_creation: u64,
    pub ro: bool,
}

#[derive(Deserialize, Debug)]
struct ShowFields {
    uuid: Uuid,
    #[serde(rename = "parent uuid")]
    parent_uuid: Option<Uuid>,
    #[serde(rename = "subvolume id")]
    subvolume_id: u64,
    #[serde(rename = "parent id")]
    parent_id: u64,
    #[serde(rename = "gen at creation")]
    gen_at_creation: u64,
    flags: Option<String>,
}

impl Btrfs {
    pub fn new(program: impl Into<OsString>, dry_run: bool) -> Self {
        Self {
            program: program.into(),
            dry_run,
        }
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// The filesystem uuid reported by `btrfs filesystem show` for a mount.
    pub fn filesystem_uuid(&self, mount: &Path) -> Result<Uuid> {
        let output_data = btrfs_cmd!(self, "filesystem", "show", mount)?;

        lazy_static! {
            static ref RE_UUID: Regex = Regex::new(r"(?m)\buuid:\s+(.*?)\s*$").unwrap();
        }
        RE_UUID
            .captures(&output_data)
            .and_then(|m| m.get(1))
            .context("btrfs filesystem show output has no uuid line.")?
            .as_str()
            .parse()
            .context("btrfs filesystem show reported an unparsable uuid.")
    }

    /// Tabular subvolume listing sorted by creation generation ascending.
    /// Header and separator rows are skipped silently.
    pub fn list_subvolumes(&self, mount: &Path) -> Result<Vec<ListedSubvolume>> {
        let output_data = btrfs_cmd!(self, "subvolume", "list", "-t", "--sort=ogen", mount)?;
        Ok(output_data.lines().filter_map(Self::parse_table_row).collect())
    }

    fn parse_table_row(line: &str) -> Option<ListedSubvolume> {
        let fields = table_row_fields(line);
        if fields.len() != 4 {
            return None;
        }
        Some(ListedSubvolume {
            id: fields[0].parse().ok()?,
            gen: fields[1].parse().ok()?,
            toplevel_id: fields[2].parse().ok()?,
            path: PathBuf::from(fields[3]),
        })
    }

    pub fn show_subvolume(&self, path: &Path) -> Result<SubvolumeShow> {
        let output_data = btrfs_cmd!(self, "subvolume", "show", path)?;
        Self::parse_show(&output_data).map_err(|error| {
            CloneError::InventoryIncomplete {
                path: path.to_path_buf(),
                reason: format!("{:#}", error),
            }
            .into()
        })
    }

    fn parse_show(data: &str) -> Result<SubvolumeShow> {
        let kvps = show_block_pairs(data).context("Failed to parse output of btrfs subvolume show.")?;

        let fields = envy::from_iter::<_, ShowFields>(kvps.into_iter().filter_map(|x| {
            if x.1 != "-" {
                Some((x.0.to_uppercase(), x.1))
            } else {
                None
            }
        }))
        .context("Failed loading attributes from btrfs subvolume show output.")?;

        Ok(SubvolumeShow {
            id: fields.subvolume_id,
            uuid: fields.uuid,
            parent_uuid: fields.parent_uuid,
            parent_id: fields.parent_id,
            gen_at_creation: fields.gen_at_creation,
            ro: fields.flags.map_or(false, |flags| flags.contains("readonly")),
        })
    }

    /// Reads the `ro` property of a subvolume.
    pub fn get_ro(&self, path: &Path) -> Result<bool> {
        let output_data = btrfs_cmd!(self, "property", "get", "-ts", path, "ro")?;
        let pairs: Vec<StringPair> = parse_key_value_pair_lines(output_data.lines(), "=")
            .context("Failed to parse output of btrfs property get.")?;
        let value = pairs
            .iter()
            .find(|(key, _)| key == "ro")
            .map(|(_, value)| value.as_str())
            .ok_or_else(|| anyhow!("btrfs property get did not report 'ro': {}", output_data))?;
        match value {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(anyhow!("Unexpected value for the ro property: {}", other)),
        }
    }

    pub fn set_ro(&self, path: &Path, value: bool) -> Result<()> {
        let value = if value { "true" } else { "false" };
        if self.dry_run {
            info!("Would set property ro={} on {:?}.", value, path);
            return Ok(());
        }
        btrfs_cmd!(self, "property", "set", "-ts", path, "ro", value)
            .map(|_| ())
            .with_context(|| format!("Failed to set property ro={} on {:?}.", value, path))
    }

    /// Creates a read-only snapshot of `source` at `target`.
    pub fn snapshot_ro(&self, source: &Path, target: &Path) -> Result<()> {
        if self.dry_run {
            info!("Would snapshot {:?} read-only at {:?}.", source, target);
            return Ok(());
        }
        btrfs_cmd!(self, "subvolume", "snapshot", "-r", source, target)
            .map(|_| ())
            .with_context(|| format!("Failed to create btrfs snapshot at {:?}.", target))
    }

    pub fn delete_subvolume(&self, path: &Path) -> Result<()> {
        if self.dry_run {
            info!("Would delete subvolume {:?}.", path);
            return Ok(());
        }
        btrfs_cmd!(self, "subvolume", "delete", path)
            .map(|_| ())
            .with_context(|| format!("Failed to delete subvolume {:?}.", path))
    }

    /// Composes the sending half of a replication pipeline.
    pub fn send_command(
        &self,
        source: &Path,
        parent: Option<&Path>,
        clone_sources: &[PathBuf],
        verbose: bool,
    ) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("send");
        if verbose {
            command.arg("-v");
        }
        if let Some(parent) = parent {
            command.arg("-p").arg(parent);
        }
        for clone_source in clone_sources {
            command.arg("-c").arg(clone_source);
        }
        command.arg(source);
        command
    }

    /// Composes the receiving half of a replication pipeline.
    pub fn receive_command(&self, directory: &Path, verbose: bool) -> Command {
        let mut command = Command::new(&self.program);
        command.arg("receive");
        if verbose {
            command.arg("-v");
        }
        command.arg(directory);
        command
    }
}
