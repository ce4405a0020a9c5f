//! Static plan validation.
//!
//! Runs before any device is touched and reports every issue it finds at once.
//! The only I/O is read-only probing of the referenced devices.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};

use tracing::debug;

use super::mounts::ordered_mount_entries;
use super::options::MountOptions;
use super::size::{KIB, MIB, Size};
use super::{DiskSpec, Plan};
use crate::device::BlockProbe;
use crate::error::{ProvisionError, Result};
use crate::types::{FsType, Role};

/// First usable MiB on a GPT disk (alignment + primary table).
pub const FIRST_USABLE_MIB: u64 = 1;
/// MiB kept free at the end for the backup GPT.
pub const TAIL_RESERVED_MIB: u64 = 1;

const MIN_NODE_SIZE: u64 = 4 * KIB;
const MAX_NODE_SIZE: u64 = 64 * KIB;

/// Resolved extent of one partition, in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start_mib: u64,
    /// Exclusive end
    pub end_mib: u64,
}

/// Validate `plan` against the devices visible through `probe`.
///
/// Returns `InvalidPlan` listing every issue.
pub fn validate<P: BlockProbe + ?Sized>(plan: &Plan, probe: &P) -> Result<()> {
    let issues = collect_issues(plan, probe);
    if issues.is_empty() {
        debug!("plan valid: {} disk(s)", plan.disks.len());
        Ok(())
    } else {
        Err(ProvisionError::InvalidPlan { issues })
    }
}

/// Every issue found in `plan`, in discovery order.
pub fn collect_issues<P: BlockProbe + ?Sized>(plan: &Plan, probe: &P) -> Vec<String> {
    let mut issues = Vec::new();

    if plan.disks.is_empty() {
        issues.push("plan declares no disks".to_string());
    }

    if let Some(root) = &plan.target_root {
        check_target_root(root, None, &mut issues);
    }
    check_devices(plan, probe, &mut issues);
    check_names(plan, &mut issues);
    check_partitions(plan, &mut issues);
    check_subvolumes(plan, &mut issues);
    check_mount_points(plan, &mut issues);

    issues
}

/// Check where the installed system is assembled.
///
/// The root must be absolute, free of `..`, not the live `/`, and must not
/// contain or sit inside `scratch_dir` when one is given.
pub fn check_target_root(root: &Path, scratch_dir: Option<&Path>, issues: &mut Vec<String>) {
    if !root.is_absolute() {
        issues.push(format!("target_root {} is not absolute", root.display()));
        return;
    }
    if root.components().any(|c| matches!(c, Component::ParentDir)) {
        issues.push(format!("target_root {} contains '..'", root.display()));
    }
    if root == Path::new("/") {
        issues.push("target_root / is the running system".to_string());
        return;
    }
    if let Some(scratch) = scratch_dir {
        if scratch.starts_with(root) || root.starts_with(scratch) {
            issues.push(format!(
                "target_root {} overlaps scratch_dir {}",
                root.display(),
                scratch.display()
            ));
        }
    }
}

fn check_devices<P: BlockProbe + ?Sized>(plan: &Plan, probe: &P, issues: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for disk in &plan.disks {
        if !seen.insert(&disk.device) {
            issues.push(format!("device {} is declared twice", disk.device.display()));
            continue;
        }
        if !probe.is_block_device(&disk.device) {
            issues.push(format!(
                "device {} does not exist or is not a block device",
                disk.device.display()
            ));
            check_extents(disk, None, issues);
            continue;
        }
        match probe.device_size(&disk.device) {
            Ok(bytes) => {
                check_extents(disk, Some(bytes / MIB), issues);
            }
            Err(e) => issues.push(format!(
                "cannot read size of {}: {}",
                disk.device.display(),
                e
            )),
        }
    }
}

fn check_names(plan: &Plan, issues: &mut Vec<String>) {
    let mut labels = HashSet::new();
    let mut mappers = HashSet::new();
    for part in plan.partitions() {
        let label = &part.spec.label;
        if label.trim().is_empty() {
            issues.push(format!(
                "partition {} on {} has an empty label",
                part.number,
                part.disk.device.display()
            ));
        } else if !labels.insert(label.as_str()) {
            issues.push(format!("partition label {} is declared twice", label));
        }

        if let Some(name) = part.mapper_name() {
            if name.is_empty() || name.contains('/') {
                issues.push(format!("invalid mapped name '{}' for {}", name, label));
            } else if !mappers.insert(name.clone()) {
                issues.push(format!("mapped name {} is declared twice", name));
            }
        }
    }
}

/// Resolve partition extents for `disk`, pushing overlap and capacity issues.
///
/// `capacity_mib` is `None` when the device could not be probed; extents are
/// still checked against each other.
pub fn check_extents(disk: &DiskSpec, capacity_mib: Option<u64>, issues: &mut Vec<String>) -> Vec<Extent> {
    let last_usable = capacity_mib.map(|c| c.saturating_sub(TAIL_RESERVED_MIB));
    let mut extents: Vec<Extent> = Vec::new();
    let mut cursor = FIRST_USABLE_MIB;
    let count = disk.partitions.len();

    for (i, part) in disk.partitions.iter().enumerate() {
        let start = match part.start {
            Some(Size::Remainder) => {
                issues.push(format!("partition {} start cannot be 'remainder'", part.label));
                cursor
            }
            Some(offset) => offset.mib_ceil().unwrap_or(cursor),
            None => cursor,
        };

        if start < FIRST_USABLE_MIB {
            issues.push(format!(
                "partition {} starts inside the first {} MiB reserved for alignment",
                part.label, FIRST_USABLE_MIB
            ));
        }
        if let Some(prev) = extents.last() {
            if start < prev.end_mib {
                issues.push(format!(
                    "partition {} (starting at {} MiB) overlaps partition {} (ending at {} MiB) on {}",
                    part.label,
                    start,
                    disk.partitions[i - 1].label,
                    prev.end_mib,
                    disk.device.display()
                ));
            }
        }

        let end = match part.size {
            Size::Remainder => {
                if i + 1 != count {
                    issues.push(format!(
                        "partition {} uses 'remainder' but is not the last partition on {}",
                        part.label,
                        disk.device.display()
                    ));
                }
                match last_usable {
                    Some(last) if last > start => last,
                    Some(_) => {
                        issues.push(format!(
                            "no space left for partition {} on {}",
                            part.label,
                            disk.device.display()
                        ));
                        start
                    }
                    None => start,
                }
            }
            Size::Bytes(_) => start + part.size.mib_ceil().unwrap_or(0),
        };

        if let Some(last) = last_usable {
            if end > last {
                issues.push(format!(
                    "partition {} ends at {} MiB, beyond the usable capacity of {} ({} MiB)",
                    part.label,
                    end,
                    disk.device.display(),
                    last
                ));
            }
        }

        extents.push(Extent {
            start_mib: start,
            end_mib: end,
        });
        cursor = end;
    }

    extents
}

fn check_partitions(plan: &Plan, issues: &mut Vec<String>) {
    for disk in &plan.disks {
        let esp_count = disk
            .partitions
            .iter()
            .filter(|p| p.role == Role::Boot)
            .count();
        if esp_count > 1 {
            issues.push(format!(
                "disk {} declares {} EFI system partitions; at most one is allowed",
                disk.device.display(),
                esp_count
            ));
        }
    }

    for part in plan.partitions() {
        let spec = part.spec;
        let label = &spec.label;

        if spec.role == Role::Boot {
            if spec.is_encrypted() {
                issues.push(format!("EFI system partition {} cannot be encrypted", label));
            }
            if spec.fs != FsType::Vfat {
                issues.push(format!(
                    "EFI system partition {} must be vfat, not {}",
                    label, spec.fs
                ));
            }
        }

        if spec.fs == FsType::Swap && spec.mount_point.is_some() {
            issues.push(format!("swap partition {} cannot have a mount point", label));
        }

        if let Some(features) = &spec.btrfs {
            if spec.fs != FsType::Btrfs {
                issues.push(format!(
                    "btrfs features set on {} partition {}",
                    spec.fs, label
                ));
            }
            if let Some(node_size) = features.node_size {
                check_node_size(label, node_size, issues);
            }
        }

        if spec.fs != FsType::Btrfs && has_btrfs_options(&spec.mount_options) {
            issues.push(format!(
                "btrfs-only mount options set on {} partition {}",
                spec.fs, label
            ));
        }
        check_options(label, &spec.mount_options, issues);
    }
}

fn check_node_size(label: &str, node_size: Size, issues: &mut Vec<String>) {
    let valid = match node_size.bytes() {
        Some(b) => b.is_power_of_two() && (MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&b),
        None => false,
    };
    if !valid {
        issues.push(format!(
            "btrfs node size {} on {} must be a power of two between 4KiB and 64KiB",
            node_size, label
        ));
    }
}

fn has_btrfs_options(opts: &MountOptions) -> bool {
    opts.compress.is_some() || opts.commit.is_some() || opts.nodatacow
}

fn check_options(owner: &str, opts: &MountOptions, issues: &mut Vec<String>) {
    if let Some(compress) = opts.compress {
        match (compress.algo.level_range(), compress.level) {
            (Some((lo, hi)), Some(level)) if level < lo || level > hi => issues.push(format!(
                "compression level {} for {} on {} is outside {}..={}",
                level, compress.algo, owner, lo, hi
            )),
            (None, Some(_)) => issues.push(format!(
                "compression {} on {} does not take a level",
                compress.algo, owner
            )),
            _ => {}
        }
        if opts.nodatacow {
            issues.push(format!(
                "{} sets both nodatacow and compress; nodatacow disables compression",
                owner
            ));
        }
    }
    if opts.commit == Some(0) {
        issues.push(format!("commit interval for {} must be positive", owner));
    }
}

fn check_subvolumes(plan: &Plan, issues: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for sub in &plan.subvolumes {
        let owner = format!("subvolume {} on {}", sub.name, sub.filesystem);

        match plan.partition(&sub.filesystem) {
            None => issues.push(format!(
                "{}: parent filesystem {} is not declared",
                owner, sub.filesystem
            )),
            Some(part) if part.spec.fs != FsType::Btrfs => issues.push(format!(
                "{}: parent filesystem {} is {}, not btrfs",
                owner, sub.filesystem, part.spec.fs
            )),
            Some(part) => {
                let merged = part.spec.mount_options.overlay(&sub.mount_options);
                check_options(&owner, &merged, issues);
            }
        }

        let name = Path::new(&sub.name);
        let bad_name = sub.name.trim().is_empty()
            || name.is_absolute()
            || name.components().any(|c| matches!(c, Component::ParentDir));
        if bad_name {
            issues.push(format!("{}: name must be a relative path without '..'", owner));
        } else if !seen.insert((sub.filesystem.as_str(), sub.name.as_str())) {
            issues.push(format!("{} is declared twice", owner));
        }
    }
}

fn check_mount_points(plan: &Plan, issues: &mut Vec<String>) {
    let declared = plan
        .partitions()
        .filter_map(|p| p.spec.mount_point.as_deref().map(|mp| (p.spec.label.clone(), mp)))
        .chain(
            plan.subvolumes
                .iter()
                .filter_map(|s| s.mount_point.as_deref().map(|mp| (s.name.clone(), mp))),
        );

    let mut owners: HashMap<&Path, String> = HashMap::new();
    for (owner, mp) in declared {
        if !mp.is_absolute() {
            issues.push(format!(
                "mount point {} for {} is not absolute",
                mp.display(),
                owner
            ));
        }
        if mp.components().any(|c| matches!(c, Component::ParentDir)) {
            issues.push(format!(
                "mount point {} for {} contains '..'",
                mp.display(),
                owner
            ));
        }
        if let Some(first) = owners.get(mp) {
            issues.push(format!(
                "mount point {} is declared twice ({} and {})",
                mp.display(),
                first,
                owner
            ));
        } else {
            owners.insert(mp, owner);
        }
    }

    let ordered = ordered_mount_entries(plan);
    for m in &ordered {
        let Some(parent) = m.parent.map(|i| &ordered[i].entry) else {
            continue;
        };
        if parent.noauto && !m.entry.noauto {
            issues.push(format!(
                "{} is mounted at {} beneath noauto mount {} ({}); the parent would not exist at boot",
                m.entry.describe(),
                m.entry.mount_point.as_deref().unwrap_or(Path::new("")).display(),
                parent.mount_point.as_deref().unwrap_or(Path::new("")).display(),
                parent.describe()
            ));
        }
    }
}
