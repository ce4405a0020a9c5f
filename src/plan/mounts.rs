//! Mount layout derived from a plan.
//!
//! Each partition with a mount point yields one entry; each subvolume with a
//! mount point yields a child entry carrying `subvol=/<name>`; swap partitions
//! yield an entry without a mount point. [`ordered_mount_entries`] sorts them
//! parent-before-child and records each entry's nearest ancestor.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use super::Plan;
use crate::types::{FsType, Role};

/// One mount the executor will perform and persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountPlanEntry {
    /// Label of the partition carrying the filesystem
    pub partition: String,
    pub subvolume: Option<String>,
    /// `None` for swap
    pub mount_point: Option<PathBuf>,
    pub fs: FsType,
    /// Rendered option string, `defaults` when empty
    pub options: String,
    pub dump: u8,
    pub pass: u8,
    pub role: Role,
    /// LUKS mapping name when the partition is encrypted
    pub mapper: Option<String>,
    pub noauto: bool,
}

impl MountPlanEntry {
    pub fn is_swap(&self) -> bool {
        self.fs == FsType::Swap
    }

    /// Human-readable name for reports, e.g. `HOME:@home`.
    pub fn describe(&self) -> String {
        match &self.subvolume {
            Some(sub) => format!("{}:{}", self.partition, sub),
            None => self.partition.clone(),
        }
    }
}

/// A mount entry with the index of its nearest ancestor in the ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMount {
    pub entry: MountPlanEntry,
    pub parent: Option<usize>,
}

/// All mount entries in declaration order.
pub fn mount_entries(plan: &Plan) -> Vec<MountPlanEntry> {
    let mut entries = Vec::new();

    for part in plan.partitions() {
        let spec = part.spec;
        let base = MountPlanEntry {
            partition: spec.label.clone(),
            subvolume: None,
            mount_point: None,
            fs: spec.fs,
            options: spec.mount_options.render(None),
            dump: spec.dump.unwrap_or(0),
            pass: spec.pass.unwrap_or_else(|| spec.fs.default_pass()),
            role: spec.role,
            mapper: part.mapper_name(),
            noauto: spec.mount_options.noauto,
        };

        if spec.fs == FsType::Swap {
            entries.push(MountPlanEntry {
                options: "defaults".to_string(),
                pass: 0,
                ..base
            });
            continue;
        }

        if let Some(mp) = &spec.mount_point {
            entries.push(MountPlanEntry {
                mount_point: Some(mp.clone()),
                ..base.clone()
            });
        }

        for sub in plan.subvolumes_of(&spec.label) {
            let Some(mp) = &sub.mount_point else {
                continue;
            };
            let merged = spec.mount_options.overlay(&sub.mount_options);
            entries.push(MountPlanEntry {
                subvolume: Some(sub.name.clone()),
                mount_point: Some(mp.clone()),
                options: merged.render(Some(&sub.name)),
                noauto: merged.noauto,
                ..base.clone()
            });
        }
    }

    entries
}

/// Mount entries sorted parent-before-child, swap last.
///
/// Sorting by path depth is a topological order over path nesting: an
/// ancestor always has fewer components. Ties keep declaration order.
pub fn ordered_mount_entries(plan: &Plan) -> Vec<OrderedMount> {
    let mut entries = mount_entries(plan);
    entries.sort_by_key(|e| match &e.mount_point {
        Some(mp) => depth(mp),
        None => usize::MAX,
    });

    let mut ordered: Vec<OrderedMount> = Vec::with_capacity(entries.len());
    for entry in entries {
        let parent = entry.mount_point.as_deref().and_then(|mp| nearest_ancestor(&ordered, mp));
        ordered.push(OrderedMount { entry, parent });
    }
    ordered
}

fn nearest_ancestor(ordered: &[OrderedMount], mount_point: &Path) -> Option<usize> {
    ordered
        .iter()
        .enumerate()
        .filter_map(|(i, m)| m.entry.mount_point.as_deref().map(|p| (i, p)))
        .filter(|(_, p)| *p != mount_point && mount_point.starts_with(p))
        .max_by_key(|(_, p)| depth(p))
        .map(|(i, _)| i)
}

/// Number of normal components; `/` is 0.
pub fn depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

/// Where an absolute mount point lands under the target root.
pub fn under_root(root: &Path, mount_point: &Path) -> PathBuf {
    let relative = mount_point.strip_prefix("/").unwrap_or(mount_point);
    if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Plan {
        Plan::from_toml_str(
            r#"
[[disk]]
device = "/dev/sda"

[[disk.partition]]
label = "ESP"
role = "boot"
filesystem = "vfat"
size = "1GiB"
mount_point = "/boot"

[[disk.partition]]
label = "SWAP"
role = "swap"
filesystem = "swap"
size = "8GiB"

[[disk.partition]]
label = "ROOT"
role = "root"
filesystem = "btrfs"
size = "remainder"
mount_point = "/"
mount_options = { compress = "zstd:3", noatime = true }

[[subvolume]]
filesystem = "ROOT"
name = "@log"
mount_point = "/var/log"

[[subvolume]]
filesystem = "ROOT"
name = "@images"
mount_point = "/var/lib/libvirt/images"
mount_options = { nodatacow = true }

[[subvolume]]
filesystem = "ROOT"
name = "@snapshots"
"#,
        )
        .expect("test plan parses") // test: known-good input
    }

    #[test]
    fn test_entries_cover_partitions_and_subvolumes() {
        let entries = mount_entries(&plan());
        assert_eq!(entries.len(), 5);
        let swap = entries.iter().find(|e| e.is_swap()).expect("swap entry");
        assert_eq!(swap.mount_point, None);

        let log = entries
            .iter()
            .find(|e| e.subvolume.as_deref() == Some("@log"))
            .expect("@log entry");
        assert_eq!(log.options, "subvol=/@log,noatime,compress=zstd:3");
        assert_eq!(log.describe(), "ROOT:@log");
    }

    #[test]
    fn test_order_parent_before_child() {
        let ordered = ordered_mount_entries(&plan());
        let points: Vec<Option<&Path>> = ordered
            .iter()
            .map(|m| m.entry.mount_point.as_deref())
            .collect();
        assert_eq!(points[0], Some(Path::new("/")));
        assert_eq!(points.last().copied().flatten(), None, "swap sorts last");

        for (i, m) in ordered.iter().enumerate() {
            if let Some(parent) = m.parent {
                assert!(parent < i);
            }
        }
        let images = ordered
            .iter()
            .find(|m| m.entry.subvolume.as_deref() == Some("@images"))
            .expect("@images entry");
        assert_eq!(images.parent, Some(0));
    }

    #[test]
    fn test_under_root() {
        let root = Path::new("/mnt");
        assert_eq!(under_root(root, Path::new("/")), PathBuf::from("/mnt"));
        assert_eq!(under_root(root, Path::new("/var/log")), PathBuf::from("/mnt/var/log"));
    }

    #[test]
    fn test_depth() {
        assert_eq!(depth(Path::new("/")), 0);
        assert_eq!(depth(Path::new("/home/dev")), 2);
    }
}
