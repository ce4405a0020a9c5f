//! Storage operation engine
//!
//! Compiles a validated [`Plan`] into an ordered sequence of atomic
//! [`StorageOp`]s that the executor applies one at a time.
//!
//! # Phases
//!
//! | Stage                | Operations generated |
//! |----------------------|----------------------|
//! | Wiping               | WipeSignatures per disk |
//! | Partitioning         | CreatePartitionTable → CreatePartition (declared order) |
//! | WaitingForPartitions | WaitForPartitions per disk |
//! | Formatting           | [LuksFormat → LuksOpen →] FormatFs [→ LuksClose] |
//! | CreatingSubvolumes   | [LuksOpen →] CreateDir → MountScratch → CreateSubvolume/SetNoCow → UnmountScratch [→ LuksClose] |
//! | Mounting             | LuksOpen → CreateDir → Mount (parents first) → SwapOn |
//! | WritingMountTable    | CreateDir → WriteMountTable [→ WriteCrypttab] |
//!
//! # Design
//!
//! - **Pure logic**: no I/O, the plan is only read
//! - **Explicit dependencies**: every op lists the ops it needs; a failed
//!   dependency means the dependant is skipped
//! - **Checked**: [`StoragePlan::check_order`] proves every dependency runs first

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::device::{FormatRequest, NewPartition};
use crate::error::{ProvisionError, Result};
use crate::mount_table::{crypttab_path, fstab_path};
use crate::plan::mounts::{ordered_mount_entries, under_root};
use crate::plan::validate::{check_extents, check_target_root};
use crate::plan::{EncryptionSpec, MountPlanEntry, PartitionRef, Plan};
use crate::provision_state::ProvisionStage;
use crate::types::{FsType, Role, TableType};

// ============================================================================
// Storage Operation Types
// ============================================================================

/// Where a mount entry's filesystem lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountSource {
    pub entry: MountPlanEntry,
    /// Mapped device when encrypted, else the partition node
    pub device: PathBuf,
}

/// An encrypted volume that belongs in crypttab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CryptVolume {
    pub mapper: String,
    /// The LUKS container (raw partition node)
    pub container: PathBuf,
}

/// A single atomic storage operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StorageOp {
    /// Remove existing filesystem/RAID/LUKS signatures (wipefs)
    WipeSignatures { device: PathBuf },

    CreatePartitionTable { disk: PathBuf, table: TableType },

    /// One partition, named after its plan label
    CreatePartition {
        disk: PathBuf,
        #[serde(skip)]
        partition: NewPartition,
        label: String,
    },

    /// Re-read the table and poll until every expected node exists
    WaitForPartitions { disk: PathBuf, expected: Vec<PathBuf> },

    LuksFormat {
        device: PathBuf,
        /// Partition label, also used as the LUKS label
        label: String,
        encryption: EncryptionSpec,
    },

    LuksOpen { device: PathBuf, mapper: String },

    FormatFs {
        device: PathBuf,
        #[serde(skip)]
        request: FormatRequest,
        label: String,
    },

    LuksClose { mapper: String },

    CreateDir { path: PathBuf },

    /// Mount the top-level subvolume of a btrfs filesystem to a scratch point
    MountScratch { device: PathBuf, target: PathBuf },

    CreateSubvolume { path: PathBuf },

    /// `chattr +C` on a freshly created, still empty subvolume
    SetNoCow { path: PathBuf },

    UnmountScratch { target: PathBuf },

    Mount { source: MountSource, target: PathBuf },

    SwapOn { source: MountSource },

    WriteMountTable { path: PathBuf, sources: Vec<MountSource> },

    WriteCrypttab { path: PathBuf, volumes: Vec<CryptVolume> },
}

impl StorageOp {
    /// True for operations that destroy existing data.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::WipeSignatures { .. }
                | Self::CreatePartitionTable { .. }
                | Self::CreatePartition { .. }
                | Self::LuksFormat { .. }
                | Self::FormatFs { .. }
        )
    }
}

impl fmt::Display for StorageOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WipeSignatures { device } => write!(f, "WipeSignatures({})", device.display()),
            Self::CreatePartitionTable { disk, table } => {
                write!(f, "CreatePartitionTable({}, {})", disk.display(), table)
            }
            Self::CreatePartition { disk, partition, label } => {
                let end = match partition.end_mib {
                    Some(end) => format!("{}MiB", end),
                    None => "100%".to_string(),
                };
                write!(
                    f,
                    "CreatePartition({} #{} {}, {}MiB..{}{})",
                    disk.display(),
                    partition.number,
                    label,
                    partition.start_mib,
                    end,
                    if partition.esp { ", esp" } else { "" }
                )
            }
            Self::WaitForPartitions { disk, expected } => {
                write!(f, "WaitForPartitions({}, {} node(s))", disk.display(), expected.len())
            }
            Self::LuksFormat { device, label, encryption } => {
                write!(f, "LuksFormat({}, label={}, cipher={})", device.display(), label, encryption.cipher)
            }
            Self::LuksOpen { device, mapper } => {
                write!(f, "LuksOpen({} -> /dev/mapper/{})", device.display(), mapper)
            }
            Self::FormatFs { device, request, .. } => {
                write!(f, "FormatFs({}, fs={}, label={})", device.display(), request.fs, request.label)
            }
            Self::LuksClose { mapper } => write!(f, "LuksClose({})", mapper),
            Self::CreateDir { path } => write!(f, "CreateDir({})", path.display()),
            Self::MountScratch { device, target } => {
                write!(f, "MountScratch({} -> {})", device.display(), target.display())
            }
            Self::CreateSubvolume { path } => write!(f, "CreateSubvolume({})", path.display()),
            Self::SetNoCow { path } => write!(f, "SetNoCow({})", path.display()),
            Self::UnmountScratch { target } => write!(f, "UnmountScratch({})", target.display()),
            Self::Mount { source, target } => write!(
                f,
                "Mount({} -> {}, opts={})",
                source.device.display(),
                target.display(),
                source.entry.options
            ),
            Self::SwapOn { source } => write!(f, "SwapOn({})", source.device.display()),
            Self::WriteMountTable { path, sources } => {
                write!(f, "WriteMountTable({}, {} entries)", path.display(), sources.len())
            }
            Self::WriteCrypttab { path, volumes } => {
                write!(f, "WriteCrypttab({}, {} volumes)", path.display(), volumes.len())
            }
        }
    }
}

/// An operation with its stage and the indices of the ops it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedOp {
    pub op: StorageOp,
    pub stage: ProvisionStage,
    pub depends_on: Vec<usize>,
}

/// A complete storage plan: an ordered list of operations.
#[derive(Debug, Clone, Serialize)]
pub struct StoragePlan {
    pub ops: Vec<PlannedOp>,
    /// Directory under which the installed system is assembled
    pub target_root: PathBuf,
    /// Target disks in declaration order
    pub disks: Vec<PathBuf>,
    /// Whether any partition is encrypted
    pub encrypted: bool,
}

impl StoragePlan {
    /// Returns true if this plan includes destructive operations.
    pub fn is_destructive(&self) -> bool {
        self.ops.iter().any(|p| p.op.is_destructive())
    }

    /// Every dependency precedes its dependant and stages never go backwards.
    pub fn check_order(&self) -> Result<()> {
        let mut issues = Vec::new();
        for (i, planned) in self.ops.iter().enumerate() {
            for &dep in &planned.depends_on {
                if dep >= i {
                    issues.push(format!(
                        "operation {} ({}) depends on operation {} which does not run before it",
                        i + 1,
                        planned.op,
                        dep + 1
                    ));
                }
            }
            if i > 0 && planned.stage.order() < self.ops[i - 1].stage.order() {
                issues.push(format!(
                    "operation {} ({}) runs in stage '{}' after stage '{}'",
                    i + 1,
                    planned.op,
                    planned.stage,
                    self.ops[i - 1].stage
                ));
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::InvalidPlan { issues })
        }
    }

    /// Operations belonging to one stage.
    pub fn ops_in(&self, stage: ProvisionStage) -> impl Iterator<Item = (usize, &PlannedOp)> {
        self.ops
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.stage == stage)
    }

    /// Returns a summary of the plan for logging/display.
    pub fn summary(&self) -> String {
        let disks: Vec<String> = self.disks.iter().map(|d| d.display().to_string()).collect();
        let mut lines = vec![
            "Storage Plan".to_string(),
            format!("  Targets: {}", disks.join(", ")),
            format!("  Root: {}", self.target_root.display()),
            format!("  Encrypted: {}", self.encrypted),
            format!("  Operations ({}):", self.ops.len()),
        ];
        let mut stage = None;
        for (i, planned) in self.ops.iter().enumerate() {
            if stage != Some(planned.stage) {
                lines.push(format!("  [{}]", planned.stage));
                stage = Some(planned.stage);
            }
            let after = if planned.depends_on.is_empty() {
                String::new()
            } else {
                let deps: Vec<String> = planned.depends_on.iter().map(|d| (d + 1).to_string()).collect();
                format!("  (after {})", deps.join(", "))
            };
            lines.push(format!("    {}. {}{}", i + 1, planned.op, after));
        }
        lines.join("\n")
    }
}

// ============================================================================
// Plan Compilation
// ============================================================================

/// Compile a validated plan into storage operations.
///
/// `target_root` is where mount points are assembled, `scratch_dir` holds
/// temporary top-level mounts used to create subvolumes.
///
/// # What This Explicitly Refuses To Do
///
/// - Validating devices: call [`crate::plan::validate`] first.
/// - Executing anything: this is pure plan generation. No I/O.
pub fn compile(plan: &Plan, target_root: &Path, scratch_dir: &Path) -> Result<StoragePlan> {
    if plan.disks.is_empty() {
        return Err(ProvisionError::invalid_plan("plan declares no disks"));
    }
    let mut issues = Vec::new();
    check_target_root(target_root, Some(scratch_dir), &mut issues);
    if !issues.is_empty() {
        return Err(ProvisionError::InvalidPlan { issues });
    }

    let mut builder = Builder::default();
    let disks: Vec<PathBuf> = plan.disks.iter().map(|d| d.device.clone()).collect();

    // Wipe + partition
    let mut wait_ops = Vec::new();
    for disk in &plan.disks {
        let wipe = builder.push(
            StorageOp::WipeSignatures { device: disk.device.clone() },
            ProvisionStage::Wiping,
            vec![],
        );
        builder.wipes.push(wipe);
    }
    let mut partition_ops_per_disk = Vec::new();
    for (d, disk) in plan.disks.iter().enumerate() {
        let table = builder.push(
            StorageOp::CreatePartitionTable { disk: disk.device.clone(), table: disk.table },
            ProvisionStage::Partitioning,
            vec![builder.wipes[d]],
        );
        let mut scratch_issues = Vec::new();
        let extents = check_extents(disk, None, &mut scratch_issues);
        let mut prev = table;
        let mut created = Vec::new();
        for (i, (spec, extent)) in disk.partitions.iter().zip(&extents).enumerate() {
            let number = i as u32 + 1;
            let partition = NewPartition {
                number,
                name: spec.label.clone(),
                fs: spec.fs,
                start_mib: extent.start_mib,
                end_mib: spec.size.mib_ceil().map(|mib| extent.start_mib + mib),
                esp: spec.role == Role::Boot,
            };
            prev = builder.push(
                StorageOp::CreatePartition {
                    disk: disk.device.clone(),
                    partition,
                    label: spec.label.clone(),
                },
                ProvisionStage::Partitioning,
                vec![prev],
            );
            created.push(prev);
        }
        partition_ops_per_disk.push(created);
    }
    for (d, disk) in plan.disks.iter().enumerate() {
        let expected = (1..=disk.partitions.len() as u32)
            .map(|n| crate::device::partition_path(&disk.device, n))
            .collect();
        let deps = match partition_ops_per_disk[d].last() {
            Some(&last) => vec![last],
            None => vec![],
        };
        wait_ops.push(builder.push(
            StorageOp::WaitForPartitions { disk: disk.device.clone(), expected },
            ProvisionStage::WaitingForPartitions,
            deps,
        ));
    }

    // Formatting
    for (d, disk) in plan.disks.iter().enumerate() {
        for (i, spec) in disk.partitions.iter().enumerate() {
            let part = PartitionRef { disk, spec, number: i as u32 + 1 };
            builder.format_partition(&part, wait_ops[d]);
        }
    }

    // Subvolumes
    for part in plan.partitions() {
        if part.spec.fs != FsType::Btrfs || plan.subvolumes_of(&part.spec.label).next().is_none() {
            continue;
        }
        let scratch = scratch_dir.join(part.spec.label.to_lowercase());
        let mut open = builder.open_mapping(&part, ProvisionStage::CreatingSubvolumes);
        let dir = builder.push(
            StorageOp::CreateDir { path: scratch.clone() },
            ProvisionStage::CreatingSubvolumes,
            vec![],
        );
        open.push(dir);
        let mount = builder.push(
            StorageOp::MountScratch { device: part.fs_device(), target: scratch.clone() },
            ProvisionStage::CreatingSubvolumes,
            open,
        );
        let mut created = Vec::new();
        for sub in plan.subvolumes_of(&part.spec.label) {
            let path = scratch.join(&sub.name);
            let create = builder.push(
                StorageOp::CreateSubvolume { path: path.clone() },
                ProvisionStage::CreatingSubvolumes,
                vec![mount],
            );
            created.push(create);
            let merged = part.spec.mount_options.overlay(&sub.mount_options);
            if merged.nodatacow {
                created.push(builder.push(
                    StorageOp::SetNoCow { path },
                    ProvisionStage::CreatingSubvolumes,
                    vec![create],
                ));
            }
        }
        created.push(mount);
        let unmount = builder.push(
            StorageOp::UnmountScratch { target: scratch },
            ProvisionStage::CreatingSubvolumes,
            created,
        );
        builder.touch(&part.spec.label, unmount);
        builder.close_mapping(&part, ProvisionStage::CreatingSubvolumes, unmount);
    }

    // Mounting
    let ordered = ordered_mount_entries(plan);
    for label in unique_labels(ordered.iter().map(|m| &m.entry)) {
        if let Some(part) = plan.partition(label) {
            builder.open_mapping(&part, ProvisionStage::Mounting);
        }
    }
    let mut mount_ops: Vec<Option<usize>> = Vec::with_capacity(ordered.len());
    let mut activated = Vec::new();
    let mut sources = Vec::new();
    for ordered_mount in &ordered {
        let entry = &ordered_mount.entry;
        let Some(part) = plan.partition(&entry.partition) else {
            mount_ops.push(None);
            continue;
        };
        let source = MountSource { entry: entry.clone(), device: part.fs_device() };
        sources.push(source.clone());
        let ready = builder.ready_for_mount(&part);

        let Some(mount_point) = &entry.mount_point else {
            let swap = builder.push(StorageOp::SwapOn { source }, ProvisionStage::Mounting, ready);
            activated.push(swap);
            mount_ops.push(None);
            continue;
        };

        let target = under_root(target_root, mount_point);
        let parent_mount = ordered_mount.parent.and_then(|p| mount_ops.get(p).copied().flatten());
        let dir = builder.push(
            StorageOp::CreateDir { path: target.clone() },
            ProvisionStage::Mounting,
            parent_mount.into_iter().collect(),
        );
        let mut deps = ready;
        deps.push(dir);
        let mount = builder.push(StorageOp::Mount { source, target }, ProvisionStage::Mounting, deps);
        activated.push(mount);
        mount_ops.push(Some(mount));
    }

    // Mount tables
    let etc = under_root(target_root, Path::new("/etc"));
    let etc_dir = builder.push(
        StorageOp::CreateDir { path: etc },
        ProvisionStage::WritingMountTable,
        activated.clone(),
    );
    builder.push(
        StorageOp::WriteMountTable { path: fstab_path(target_root), sources },
        ProvisionStage::WritingMountTable,
        vec![etc_dir],
    );
    let volumes: Vec<CryptVolume> = plan
        .partitions()
        .filter_map(|p| {
            p.mapper_name().map(|mapper| CryptVolume { mapper, container: p.node() })
        })
        .collect();
    if !volumes.is_empty() {
        builder.push(
            StorageOp::WriteCrypttab { path: crypttab_path(target_root), volumes },
            ProvisionStage::WritingMountTable,
            vec![etc_dir],
        );
    }

    let storage = StoragePlan {
        ops: builder.ops,
        target_root: target_root.to_path_buf(),
        disks,
        encrypted: plan.needs_passphrase(),
    };
    storage.check_order()?;
    Ok(storage)
}

/// Partition labels in first-seen order.
fn unique_labels<'a>(entries: impl Iterator<Item = &'a MountPlanEntry>) -> Vec<&'a str> {
    let mut labels: Vec<&str> = Vec::new();
    for entry in entries {
        if !labels.contains(&entry.partition.as_str()) {
            labels.push(&entry.partition);
        }
    }
    labels
}

/// Tracks, per partition label, the op that last made its filesystem usable.
#[derive(Default)]
struct Builder {
    ops: Vec<PlannedOp>,
    wipes: Vec<usize>,
    /// (label, op index of the latest FormatFs / LuksClose / LuksOpen)
    last_touch: Vec<(String, usize)>,
}

impl Builder {
    fn push(&mut self, op: StorageOp, stage: ProvisionStage, depends_on: Vec<usize>) -> usize {
        self.ops.push(PlannedOp { op, stage, depends_on });
        self.ops.len() - 1
    }

    fn touch(&mut self, label: &str, index: usize) {
        match self.last_touch.iter_mut().find(|(l, _)| l == label) {
            Some(slot) => slot.1 = index,
            None => self.last_touch.push((label.to_string(), index)),
        }
    }

    fn last(&self, label: &str) -> Vec<usize> {
        self.last_touch
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, i)| vec![*i])
            .unwrap_or_default()
    }

    fn format_partition(&mut self, part: &PartitionRef<'_>, wait: usize) {
        let spec = part.spec;
        let node = part.node();
        let mut deps = vec![wait];

        if let (Some(mapper), Some(encryption)) = (part.mapper_name(), &spec.encryption) {
            let format = self.push(
                StorageOp::LuksFormat {
                    device: node.clone(),
                    label: spec.label.clone(),
                    encryption: encryption.clone(),
                },
                ProvisionStage::Formatting,
                deps,
            );
            let open = self.push(
                StorageOp::LuksOpen { device: node, mapper },
                ProvisionStage::Formatting,
                vec![format],
            );
            deps = vec![open];
        }

        let request = FormatRequest {
            fs: spec.fs,
            label: spec.label.clone(),
            checksum: spec.btrfs.as_ref().map(|b| b.checksum),
            node_size: spec.btrfs.as_ref().and_then(|b| b.node_size).and_then(|s| s.bytes()),
        };
        let format = self.push(
            StorageOp::FormatFs {
                device: part.fs_device(),
                request,
                label: spec.label.clone(),
            },
            ProvisionStage::Formatting,
            deps,
        );
        self.touch(&spec.label, format);
        self.close_mapping(part, ProvisionStage::Formatting, format);
    }

    /// Open the mapping for an encrypted partition; returns the deps to use.
    fn open_mapping(&mut self, part: &PartitionRef<'_>, stage: ProvisionStage) -> Vec<usize> {
        let deps = self.last(&part.spec.label);
        let Some(mapper) = part.mapper_name() else {
            return deps;
        };
        let open = self.push(StorageOp::LuksOpen { device: part.node(), mapper }, stage, deps);
        self.touch(&part.spec.label, open);
        vec![open]
    }

    fn close_mapping(&mut self, part: &PartitionRef<'_>, stage: ProvisionStage, after: usize) {
        if let Some(mapper) = part.mapper_name() {
            let close = self.push(StorageOp::LuksClose { mapper }, stage, vec![after]);
            self.touch(&part.spec.label, close);
        }
    }

    fn ready_for_mount(&self, part: &PartitionRef<'_>) -> Vec<usize> {
        self.last(&part.spec.label)
    }
}

// ============================================================================
// Tests
// ============================================================================
