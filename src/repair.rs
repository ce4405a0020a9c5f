//! `/home` recovery flow.
//!
//! Detects whether `/home` under the target root is mounted and, if not,
//! proposes the smallest set of actions that gives it a btrfs subvolume and
//! a UUID-keyed fstab entry. Nothing runs without `confirm`; the proposal is
//! returned either way.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::device::{ActiveMount, BlockProbe, DeviceOps};
use crate::error::{ProvisionError, Result};
use crate::mount_table::{FstabEntry, MountTable, fstab_path};
use crate::plan::mounts::under_root;
use crate::plan::{Plan, mount_entries};
use crate::settings::Settings;

/// Subvolume name used when no plan names one.
pub const DEFAULT_HOME_SUBVOLUME: &str = "@home";

/// One step of the repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    /// Mount the top level of `device` so a subvolume can be created
    MountScratch { device: PathBuf, target: PathBuf },
    CreateSubvolume { path: PathBuf },
    /// Move one pre-existing `/home` entry into the new subvolume
    MoveEntry { from: PathBuf, to: PathBuf },
    UnmountScratch { target: PathBuf },
    CreateDir { path: PathBuf },
    Mount { device: PathBuf, target: PathBuf, options: String },
    /// Replace any `/home` line in fstab with `entry`
    RegisterMount { fstab: PathBuf, entry: FstabEntry },
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MountScratch { device, target } => {
                write!(f, "mount top level of {} at {}", device.display(), target.display())
            }
            Self::CreateSubvolume { path } => write!(f, "create subvolume {}", path.display()),
            Self::MoveEntry { from, to } => write!(f, "move {} -> {}", from.display(), to.display()),
            Self::UnmountScratch { target } => write!(f, "unmount {}", target.display()),
            Self::CreateDir { path } => write!(f, "create directory {}", path.display()),
            Self::Mount { device, target, options } => write!(
                f,
                "mount {} at {} ({})",
                device.display(),
                target.display(),
                options
            ),
            Self::RegisterMount { fstab, entry } => {
                write!(f, "register in {}: {}", fstab.display(), entry)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairOutcome {
    /// `/home` was already mounted; nothing to do
    AlreadyMounted,
    /// The expected subvolume existed and only needed mounting
    MountedExisting,
    /// A new subvolume was created and populated from the old `/home`
    CreatedSubvolume,
    /// No btrfs filesystem was available; `/home` stays a plain directory
    PlainDirectory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairEvent {
    pub level: EventLevel,
    pub message: String,
}

fn event(level: EventLevel, message: impl Into<String>) -> RepairEvent {
    RepairEvent {
        level,
        message: message.into(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub root: PathBuf,
    pub outcome: RepairOutcome,
    pub actions: Vec<RepairAction>,
    pub events: Vec<RepairEvent>,
    /// False when only a proposal was produced
    pub applied: bool,
    /// Whether a fstab entry was (or would be) written
    pub registered: bool,
}

impl RepairReport {
    pub fn to_text(&self) -> String {
        let mut lines = Vec::new();
        let header = if self.applied {
            "Home repair applied"
        } else {
            "Home repair proposal (re-run with --confirm to apply)"
        };
        lines.push(format!("{} for {}", header, self.root.display()));
        for (i, action) in self.actions.iter().enumerate() {
            lines.push(format!("  {}. {}", i + 1, action));
        }
        for ev in &self.events {
            let tag = match ev.level {
                EventLevel::Info => "INFO",
                EventLevel::Warn => "WARN",
            };
            lines.push(format!("  [{}] {}", tag, ev.message));
        }
        if !self.registered {
            lines.push("  No mount entry registered.".to_string());
        }
        lines.join("\n")
    }
}

/// The filesystem `/home` will live on.
#[derive(Debug, Clone)]
struct HomeTarget {
    device: PathBuf,
    subvolume: String,
    options: String,
}

/// Detect, propose and (with `confirm`) apply the `/home` repair.
pub fn repair_home<D: DeviceOps + ?Sized>(
    plan: Option<&Plan>,
    devices: &mut D,
    settings: &Settings,
    root: Option<&Path>,
    confirm: bool,
) -> Result<RepairReport> {
    let root = root.map(Path::to_path_buf).unwrap_or_else(|| match plan {
        Some(plan) => plan.target_root_or(&settings.target_root),
        None => settings.target_root.clone(),
    });
    let scratch = settings.scratch_dir.join("repair-home");

    let mut report = propose(plan, &*devices, &root, &scratch)?;
    if !confirm || report.actions.is_empty() {
        return Ok(report);
    }

    info!("home repair confirmed for {}", root.display());
    // Listing subvolumes needs a mounted filesystem; mount first, then re-detect
    if let Some(first @ RepairAction::MountScratch { .. }) = report.actions.first().cloned() {
        apply_action(devices, &first).map_err(|e| e.in_step(first.to_string()))?;
        let mut rest = propose(plan, &*devices, &root, &scratch)?;
        rest.actions.insert(0, first);
        let mut events = std::mem::take(&mut report.events);
        events.append(&mut rest.events);
        rest.events = events;
        report = rest;
        run_actions(devices, &report.actions[1..])?;
    } else {
        run_actions(devices, &report.actions)?;
    }
    report.applied = true;
    Ok(report)
}

fn run_actions<D: DeviceOps + ?Sized>(devices: &mut D, actions: &[RepairAction]) -> Result<()> {
    for action in actions {
        apply_action(devices, action).map_err(|e| e.in_step(action.to_string()))?;
    }
    Ok(())
}

fn apply_action<D: DeviceOps + ?Sized>(devices: &mut D, action: &RepairAction) -> Result<()> {
    info!("repair: {}", action);
    match action {
        RepairAction::MountScratch { device, target } => {
            devices.create_dir_all(target)?;
            devices.mount(device, target, "btrfs", "subvolid=5")
        }
        RepairAction::CreateSubvolume { path } => devices.create_subvolume(path),
        RepairAction::MoveEntry { from, to } => devices.move_entry(from, to),
        RepairAction::UnmountScratch { target } => devices.unmount(target),
        RepairAction::CreateDir { path } => devices.create_dir_all(path),
        RepairAction::Mount { device, target, options } => {
            devices.mount(device, target, "btrfs", options)
        }
        RepairAction::RegisterMount { fstab, entry } => {
            let mut table = devices
                .read_file(fstab)?
                .map(|c| MountTable::parse(&c))
                .unwrap_or_else(MountTable::new);
            table.replace(entry.clone());
            if let Some(parent) = fstab.parent() {
                devices.create_dir_all(parent)?;
            }
            devices.write_file_atomic(fstab, &table.render())
        }
    }
}

/// Read-only detection and proposal.
fn propose<P: BlockProbe + ?Sized>(
    plan: Option<&Plan>,
    probe: &P,
    root: &Path,
    scratch: &Path,
) -> Result<RepairReport> {
    let home = under_root(root, Path::new("/home"));
    let mounts = probe.mounts()?;
    let mut report = RepairReport {
        root: root.to_path_buf(),
        outcome: RepairOutcome::AlreadyMounted,
        actions: Vec::new(),
        events: Vec::new(),
        applied: false,
        registered: false,
    };

    if let Some(active) = mounts.iter().find(|m| m.target == home) {
        report.events.push(event(
            EventLevel::Info,
            format!("{} is already mounted from {}", home.display(), active.source.display()),
        ));
        return Ok(report);
    }

    let Some(target) = select_filesystem(plan, probe, &mounts, &mut report.events)? else {
        report.outcome = RepairOutcome::PlainDirectory;
        if !probe.path_exists(&home) {
            report.actions.push(RepairAction::CreateDir { path: home.clone() });
        }
        report.events.push(event(
            EventLevel::Warn,
            format!(
                "no btrfs filesystem available; {} stays a plain directory",
                home.display()
            ),
        ));
        return Ok(report);
    };

    let uuid = probe
        .probe(&target.device)?
        .and_then(|i| i.uuid)
        .ok_or_else(|| {
            ProvisionError::command(
                format!("blkid -p -o export {}", target.device.display()),
                "no UUID reported",
            )
        })?;
    let same_fs = |m: &ActiveMount| {
        m.fs_type == "btrfs"
            && (m.source == target.device
                || probe
                    .probe(&m.source)
                    .ok()
                    .flatten()
                    .and_then(|i| i.uuid)
                    .is_some_and(|u| u == uuid))
    };

    let any_mount = mounts.iter().find(|m| same_fs(m));
    let exists = match any_mount {
        Some(m) => Some(
            probe
                .list_subvolumes(&m.target)?
                .iter()
                .any(|s| s.trim_start_matches('/') == target.subvolume),
        ),
        None => None,
    };

    if exists == Some(true) {
        report.outcome = RepairOutcome::MountedExisting;
        report.events.push(event(
            EventLevel::Info,
            format!("subvolume {} exists on {}", target.subvolume, target.device.display()),
        ));
        if mounts.iter().any(|m| m.target == scratch) {
            report.actions.push(RepairAction::UnmountScratch { target: scratch.to_path_buf() });
        }
    } else {
        report.outcome = RepairOutcome::CreatedSubvolume;
        let top = mounts
            .iter()
            .find(|m| same_fs(m) && m.subvolume().unwrap_or_default().is_empty())
            .map(|m| m.target.clone());
        let (top, scratch_used) = match top {
            Some(top) => {
                let scratch_used = top == scratch;
                (top, scratch_used)
            }
            None => {
                report.actions.push(RepairAction::MountScratch {
                    device: target.device.clone(),
                    target: scratch.to_path_buf(),
                });
                (scratch.to_path_buf(), true)
            }
        };
        if exists.is_none() {
            report.events.push(event(
                EventLevel::Info,
                format!(
                    "{} is not mounted; subvolume {} is assumed missing until mounted",
                    target.device.display(),
                    target.subvolume
                ),
            ));
        }

        let subvol_path = top.join(&target.subvolume);
        report.actions.push(RepairAction::CreateSubvolume { path: subvol_path.clone() });
        if probe.path_exists(&home) {
            for entry in probe.dir_entries(&home)? {
                let Some(name) = entry.file_name() else {
                    continue;
                };
                let to = subvol_path.join(name);
                if probe.path_exists(&to) {
                    report.events.push(event(
                        EventLevel::Warn,
                        format!("{} already exists; {} left in place", to.display(), entry.display()),
                    ));
                    continue;
                }
                report.actions.push(RepairAction::MoveEntry { from: entry, to });
            }
        }
        if scratch_used {
            report.actions.push(RepairAction::UnmountScratch { target: scratch.to_path_buf() });
        }
    }

    if !probe.path_exists(&home) {
        report.actions.push(RepairAction::CreateDir { path: home.clone() });
    }
    report.actions.push(RepairAction::Mount {
        device: target.device.clone(),
        target: home,
        options: target.options.clone(),
    });
    report.actions.push(RepairAction::RegisterMount {
        fstab: fstab_path(root),
        entry: FstabEntry::by_uuid(&uuid, "/home", "btrfs", &target.options, 0, 0),
    });
    report.registered = true;
    Ok(report)
}

/// The plan's home filesystem when usable, else the mounted btrfs
/// filesystem with the most free space.
fn select_filesystem<P: BlockProbe + ?Sized>(
    plan: Option<&Plan>,
    probe: &P,
    mounts: &[ActiveMount],
    events: &mut Vec<RepairEvent>,
) -> Result<Option<HomeTarget>> {
    if let Some(plan) = plan {
        let planned = mount_entries(plan)
            .into_iter()
            .find(|e| e.mount_point.as_deref() == Some(Path::new("/home")));
        if let Some(entry) = planned {
            if let Some(part) = plan.partition(&entry.partition) {
                let device = part.fs_device();
                match &entry.subvolume {
                    Some(sub) if probe.is_block_device(&device) => {
                        return Ok(Some(HomeTarget {
                            device,
                            subvolume: sub.clone(),
                            options: entry.options.clone(),
                        }));
                    }
                    Some(_) => events.push(event(
                        EventLevel::Warn,
                        format!("planned home filesystem {} is not available", device.display()),
                    )),
                    None => events.push(event(
                        EventLevel::Warn,
                        format!("plan mounts {} directly at /home; no subvolume to repair", entry.partition),
                    )),
                }
            }
        }
    }

    let mut best: Option<(u64, &ActiveMount)> = None;
    for mount in mounts.iter().filter(|m| m.fs_type == "btrfs") {
        let free = match probe.free_space(&mount.target) {
            Ok(free) => free,
            Err(e) => {
                warn!("cannot stat {}: {}", mount.target.display(), e);
                continue;
            }
        };
        if best.is_none_or(|(best_free, _)| free > best_free) {
            best = Some((free, mount));
        }
    }

    Ok(best.map(|(free, mount)| {
        events.push(event(
            EventLevel::Info,
            format!(
                "selected {} ({} MiB free, mounted at {})",
                mount.source.display(),
                free / (1024 * 1024),
                mount.target.display()
            ),
        ));
        HomeTarget {
            device: mount.source.clone(),
            subvolume: DEFAULT_HOME_SUBVOLUME.to_string(),
            options: format!("subvol=/{}", DEFAULT_HOME_SUBVOLUME),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevices;

    #[test]
    fn test_plain_directory_fallback() {
        let mut devices = FakeDevices::new();
        let settings = Settings::default();
        let report = repair_home(None, &mut devices, &settings, None, true).expect("repair");
        assert_eq!(report.outcome, RepairOutcome::PlainDirectory);
        assert!(!report.registered);
        assert!(report.applied);
        assert!(devices.path_exists(Path::new("/mnt/home")));
        assert!(report.to_text().contains("No mount entry registered."));
    }

    #[test]
    fn test_proposal_without_confirm_is_read_only() {
        let mut devices = FakeDevices::new();
        let report = repair_home(None, &mut devices, &Settings::default(), None, false).expect("propose");
        assert!(!report.applied);
        assert_eq!(
            report.actions,
            vec![RepairAction::CreateDir { path: PathBuf::from("/mnt/home") }]
        );
        assert_eq!(devices.mutation_count(), 0);
    }

    #[test]
    fn test_action_display() {
        let action = RepairAction::MoveEntry {
            from: PathBuf::from("/mnt/home/alice"),
            to: PathBuf::from("/mnt/@home/alice"),
        };
        assert_eq!(action.to_string(), "move /mnt/home/alice -> /mnt/@home/alice");
    }
}
