use crate::inventory::{Inventory, Subvolume};
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};

/// How parent and clone-source references are chosen for each send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Strategy {
    /// Follow the original snapshot genealogy: the nearest inventoried
    /// ancestor becomes the parent, the whole chain the clone sources, and
    /// every subvolume is received directly at its final directory.
    Parent,
    /// Walk each snapshot family newest-first so that every transfer is the
    /// delta between two temporally adjacent siblings, received into a flat
    /// staging layout and moved into place afterwards.
    Snapshot,
}

/// One send/receive work item, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationJob {
    pub subvol_id: u64,
    pub source_path: PathBuf,
    pub receive_dir: PathBuf,
    /// Where the received copy materializes (`receive_dir` + basename).
    pub received_path: PathBuf,
    pub parent: Option<PathBuf>,
    pub clone_sources: Vec<PathBuf>,
    /// Whether to clear the `ro` property of the received copy.
    pub clear_ro: bool,
}

/// The flat `<staging>/<id>/` layout received subvolumes pass through under
/// the snapshot strategy.
#[derive(Debug, Clone)]
pub struct Staging {
    base: PathBuf,
}

impl Staging {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn root(&self) -> &Path {
        &self.base
    }

    pub fn dir_for(&self, id: u64) -> PathBuf {
        self.base.join(id.to_string())
    }

    pub fn path_for(&self, subvol: &Subvolume) -> PathBuf {
        self.dir_for(subvol.id).join(subvol.file_name())
    }
}

/// Emits the ordered replication jobs for the whole inventory. Pure: no
/// filesystem state is consulted, so the same plan is computed under dry-run.
pub fn plan(
    inventory: &Inventory,
    strategy: Strategy,
    source_root: &Path,
    dest_root: &Path,
    staging: &Staging,
) -> Vec<ReplicationJob> {
    let mut jobs = Vec::with_capacity(inventory.len());
    match strategy {
        Strategy::Parent => plan_parent(inventory, source_root, dest_root, &mut jobs),
        Strategy::Snapshot => plan_snapshot(inventory, source_root, staging, &mut jobs),
    }
    jobs
}

fn plan_parent(inventory: &Inventory, source_root: &Path, dest_root: &Path, jobs: &mut Vec<ReplicationJob>) {
    for subvol in inventory.iter() {
        let chain = ancestor_chain(inventory, subvol);
        let goal = dest_root.join(&subvol.path);
        let receive_dir = goal
            .parent()
            .expect("destination paths always have a containing directory")
            .to_path_buf();
        jobs.push(ReplicationJob {
            subvol_id: subvol.id,
            source_path: subvol.path_under(source_root),
            receive_dir,
            received_path: goal,
            parent: chain.first().map(|ancestor| dest_root.join(&ancestor.path)),
            clone_sources: chain
                .iter()
                .map(|ancestor| dest_root.join(&ancestor.path))
                .collect(),
            clear_ro: true,
        });
    }
}

/// Ancestors reachable through `parent_uuid`, nearest first. The chain ends
/// at an original subvolume or at a parent unknown to the inventory.
fn ancestor_chain<'a>(inventory: &'a Inventory, subvol: &Subvolume) -> Vec<&'a Subvolume> {
    let mut chain: Vec<&Subvolume> = Vec::new();
    let mut cursor = subvol.parent_uuid;
    while let Some(uuid) = cursor {
        match inventory.by_uuid(&uuid) {
            Some(ancestor) if !chain.iter().any(|seen| seen.id == ancestor.id) => {
                chain.push(ancestor);
                cursor = ancestor.parent_uuid;
            }
            _ => break,
        }
    }
    chain
}

fn plan_snapshot(inventory: &Inventory, source_root: &Path, staging: &Staging, jobs: &mut Vec<ReplicationJob>) {
    let roots = inventory
        .iter()
        .filter(|sv| sv.parent_uuid.map_or(true, |uuid| inventory.by_uuid(&uuid).is_none()));
    for root in roots {
        descend(inventory, source_root, staging, root, None, jobs);
    }
}

fn descend<'a>(
    inventory: &'a Inventory,
    source_root: &Path,
    staging: &Staging,
    subvol: &'a Subvolume,
    previous: Option<&Subvolume>,
    jobs: &mut Vec<ReplicationJob>,
) {
    let parent = previous.map(|prev| staging.path_for(prev));
    jobs.push(ReplicationJob {
        subvol_id: subvol.id,
        source_path: subvol.path_under(source_root),
        receive_dir: staging.dir_for(subvol.id),
        received_path: staging.path_for(subvol),
        parent: parent.clone(),
        clone_sources: parent.into_iter().collect(),
        clear_ro: !subvol.ro,
    });

    // Newest sibling first, so each transfer diffs two adjacent snapshots.
    let mut children: Vec<&Subvolume> = inventory
        .iter()
        .filter(|candidate| candidate.parent_uuid == Some(subvol.uuid))
        .collect();
    children.sort_by(|a, b| (b.creation_gen, b.id).cmp(&(a.creation_gen, a.id)));

    let mut previous_sibling = subvol;
    for child in children {
        descend(inventory, source_root, staging, child, Some(previous_sibling), jobs);
        previous_sibling = child;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn subvol(id: u64, creation_gen: u64, path: &str, parent_uuid: Option<u64>, ro: bool) -> Subvolume {
        Subvolume {
            id,
            gen: 1000,
            toplevel_id: 5,
            path: PathBuf::from(path),
            uuid: Uuid::from_u128(id as u128),
            parent_uuid: parent_uuid.map(|p| Uuid::from_u128(p as u128)),
            parent_id: 5,
            creation_gen,
            ro,
        }
    }

    fn staging() -> Staging {
        Staging::new(PathBuf::from("/mnt/new/stage"))
    }

    #[test]
    fn single_subvolume_without_snapshots() {
        let inventory = Inventory::from_subvols(vec![subvol(256, 10, "a", None, false)]);
        let jobs = plan(
            &inventory,
            Strategy::Snapshot,
            Path::new("/mnt/old"),
            Path::new("/mnt/new"),
            &staging(),
        );

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].subvol_id, 256);
        assert_eq!(jobs[0].source_path, PathBuf::from("/mnt/old/a"));
        assert_eq!(jobs[0].receive_dir, PathBuf::from("/mnt/new/stage/256"));
        assert_eq!(jobs[0].received_path, PathBuf::from("/mnt/new/stage/256/a"));
        assert_eq!(jobs[0].parent, None);
        assert!(jobs[0].clone_sources.is_empty());
    }

    #[test]
    fn snapshot_strategy_walks_siblings_newest_first() {
        let inventory = Inventory::from_subvols(vec![
            subvol(256, 10, "live", None, false),
            subvol(257, 20, "snaps/snap1", Some(256), false),
            subvol(258, 30, "snaps/snap2", Some(256), false),
        ]);
        let jobs = plan(
            &inventory,
            Strategy::Snapshot,
            Path::new("/mnt/old"),
            Path::new("/mnt/new"),
            &staging(),
        );

        let order: Vec<u64> = jobs.iter().map(|j| j.subvol_id).collect();
        assert_eq!(order, vec![256, 258, 257]);

        assert_eq!(jobs[0].parent, None);
        assert_eq!(jobs[1].parent, Some(PathBuf::from("/mnt/new/stage/256/live")));
        assert_eq!(jobs[1].clone_sources, vec![PathBuf::from("/mnt/new/stage/256/live")]);
        assert_eq!(jobs[2].parent, Some(PathBuf::from("/mnt/new/stage/258/snap2")));
        assert_eq!(jobs[2].received_path, PathBuf::from("/mnt/new/stage/257/snap1"));
    }

    #[test]
    fn snapshot_strategy_recurses_into_grandchildren() {
        let inventory = Inventory::from_subvols(vec![
            subvol(256, 10, "live", None, false),
            subvol(257, 20, "snap-old", Some(256), false),
            subvol(258, 30, "snap-new", Some(256), false),
            subvol(259, 40, "from-old", Some(257), false),
        ]);
        let jobs = plan(
            &inventory,
            Strategy::Snapshot,
            Path::new("/mnt/old"),
            Path::new("/mnt/new"),
            &staging(),
        );

        let order: Vec<u64> = jobs.iter().map(|j| j.subvol_id).collect();
        // 258 is newest under live; 257 follows with 258 as its parent; 259
        // descends from 257 with 257 as the starting previous sibling.
        assert_eq!(order, vec![256, 258, 257, 259]);
        assert_eq!(jobs[3].parent, Some(PathBuf::from("/mnt/new/stage/257/snap-old")));
    }

    #[test]
    fn every_parent_is_received_before_it_is_referenced() {
        let inventory = Inventory::from_subvols(vec![
            subvol(256, 10, "live", None, false),
            subvol(257, 20, "s1", Some(256), false),
            subvol(258, 30, "s2", Some(256), false),
            subvol(259, 35, "s2a", Some(258), false),
            subvol(260, 40, "s3", Some(256), false),
        ]);
        let jobs = plan(
            &inventory,
            Strategy::Snapshot,
            Path::new("/mnt/old"),
            Path::new("/mnt/new"),
            &staging(),
        );

        let mut received: HashSet<PathBuf> = HashSet::new();
        for job in &jobs {
            if let Some(parent) = &job.parent {
                assert!(received.contains(parent), "parent {:?} not yet received", parent);
            }
            received.insert(job.received_path.clone());
        }
    }

    #[test]
    fn foreign_parents_are_planned_as_roots() {
        let inventory = Inventory::from_subvols(vec![subvol(256, 10, "adopted", Some(999), false)]);
        let jobs = plan(
            &inventory,
            Strategy::Snapshot,
            Path::new("/mnt/old"),
            Path::new("/mnt/new"),
            &staging(),
        );
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].parent, None);
    }

    #[test]
    fn readonly_sources_keep_their_received_copies_readonly() {
        let inventory = Inventory::from_subvols(vec![
            subvol(256, 10, "live", None, false),
            subvol(257, 20, "snap", Some(256), true),
        ]);
        let jobs = plan(
            &inventory,
            Strategy::Snapshot,
            Path::new("/mnt/old"),
            Path::new("/mnt/new"),
            &staging(),
        );
        assert!(jobs[0].clear_ro);
        assert!(!jobs[1].clear_ro);
    }

    #[test]
    fn parent_strategy_uses_ancestor_chain() {
        let inventory = Inventory::from_subvols(vec![
            subvol(256, 10, "live", None, false),
            subvol(257, 20, "snaps/snap1", Some(256), false),
            subvol(258, 30, "snaps/snap2", Some(256), false),
        ]);
        let jobs = plan(
            &inventory,
            Strategy::Parent,
            Path::new("/mnt/old"),
            Path::new("/mnt/new"),
            &staging(),
        );

        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].subvol_id, 256);
        assert_eq!(jobs[0].parent, None);
        assert_eq!(jobs[0].receive_dir, PathBuf::from("/mnt/new"));
        assert_eq!(jobs[0].received_path, PathBuf::from("/mnt/new/live"));

        for job in &jobs[1..] {
            assert_eq!(job.parent, Some(PathBuf::from("/mnt/new/live")));
            assert_eq!(job.clone_sources, vec![PathBuf::from("/mnt/new/live")]);
            assert_eq!(job.receive_dir, PathBuf::from("/mnt/new/snaps"));
            assert!(job.clear_ro);
        }
    }

    #[test]
    fn parent_strategy_chains_through_intermediate_snapshots() {
        let inventory = Inventory::from_subvols(vec![
            subvol(256, 10, "live", None, false),
            subvol(257, 20, "mid", Some(256), false),
            subvol(258, 30, "leaf", Some(257), false),
        ]);
        let jobs = plan(
            &inventory,
            Strategy::Parent,
            Path::new("/mnt/old"),
            Path::new("/mnt/new"),
            &staging(),
        );

        let leaf = jobs.iter().find(|j| j.subvol_id == 258).unwrap();
        assert_eq!(leaf.parent, Some(PathBuf::from("/mnt/new/mid")));
        assert_eq!(
            leaf.clone_sources,
            vec![PathBuf::from("/mnt/new/mid"), PathBuf::from("/mnt/new/live")]
        );
    }
}
