//! In-memory block device backend.
//!
//! `FakeDevices` models disks, partition tables, filesystem signatures, LUKS
//! mappings, btrfs subvolumes, mounts and a small file tree well enough to run
//! the executor, verifier and repair flows end to end without root. Every
//! mutating call is appended to [`FakeDevices::calls`] before it is applied, so
//! tests can assert that a refused run touched nothing.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::{
    ActiveMount, BlockInfo, BlockProbe, DeviceOps, FormatRequest, LUKS_TYPE, NewPartition,
    mapper_path, partition_path,
};
use crate::error::{ProvisionError, Result};
use crate::plan::EncryptionSpec;
use crate::plan::size::MIB;
use crate::types::{FsType, TableType};

/// LUKS2 default header size; the mapping is this much smaller than the partition.
const LUKS2_HEADER: u64 = 16 * MIB;

/// One recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    WipeSignatures(PathBuf),
    CreatePartitionTable(PathBuf),
    CreatePartition { disk: PathBuf, number: u32, name: String },
    RereadPartitions(PathBuf),
    Format { device: PathBuf, fs: FsType },
    LuksFormat(PathBuf),
    LuksOpen { device: PathBuf, name: String },
    LuksClose(String),
    CreateSubvolume(PathBuf),
    SetNoCow(PathBuf),
    Mount { source: PathBuf, target: PathBuf, options: String },
    Unmount(PathBuf),
    SwapOn(PathBuf),
    CreateDir(PathBuf),
    WriteFile(PathBuf),
    MoveEntry { from: PathBuf, to: PathBuf },
}

#[derive(Debug, Clone)]
struct FakePartition {
    number: u32,
    name: String,
    start_mib: u64,
    end_mib: u64,
}

#[derive(Debug, Clone)]
struct FakeDisk {
    size: u64,
    table: Option<TableType>,
    partitions: Vec<FakePartition>,
    /// Kernel has re-read the table and partition nodes exist
    nodes_visible: bool,
}

/// In-memory implementation of [`BlockProbe`] and [`DeviceOps`].
#[derive(Debug, Default)]
pub struct FakeDevices {
    disks: BTreeMap<PathBuf, FakeDisk>,
    /// Signatures on raw devices (disks and partition nodes)
    signatures: BTreeMap<PathBuf, BlockInfo>,
    /// Filesystem inside each LUKS container, keyed by the container device
    luks_inner: BTreeMap<PathBuf, BlockInfo>,
    /// Open mappings: name → container device
    mappings: BTreeMap<String, PathBuf>,
    mounts: Vec<ActiveMount>,
    swaps: Vec<PathBuf>,
    /// Subvolumes per filesystem UUID
    subvolumes: BTreeMap<String, BTreeSet<String>>,
    nocow: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, String>,
    dirs: BTreeSet<PathBuf>,
    /// Mount targets that fail the next N attempts
    failing_mounts: BTreeMap<PathBuf, u32>,
    /// Polls each new partition node stays invisible after a re-read
    node_delay: u32,
    withhold_nodes: bool,
    pending_polls: RefCell<BTreeMap<PathBuf, u32>>,
    next_uuid: u64,
    /// Every mutating call, in order
    pub calls: Vec<DeviceCall>,
}

fn fail(command: impl Into<String>, detail: impl Into<String>) -> ProvisionError {
    ProvisionError::command(command, detail)
}

impl FakeDevices {
    pub fn new() -> Self {
        let mut fake = Self::default();
        fake.dirs.insert(PathBuf::from("/"));
        fake
    }

    /// Add an empty disk of `size` bytes.
    pub fn with_disk(mut self, path: impl Into<PathBuf>, size: u64) -> Self {
        self.disks.insert(
            path.into(),
            FakeDisk {
                size,
                table: None,
                partitions: Vec::new(),
                nodes_visible: false,
            },
        );
        self
    }

    pub fn with_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.insert_dir_all(path.as_ref());
        self
    }

    pub fn with_file(mut self, path: impl AsRef<Path>, contents: &str) -> Self {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.insert_dir_all(parent);
        }
        self.files.insert(path.to_path_buf(), contents.to_string());
        self
    }

    /// Make partition nodes appear only after `polls` existence checks.
    pub fn with_node_delay(mut self, polls: u32) -> Self {
        self.node_delay = polls;
        self
    }

    /// Partition nodes never appear after a re-read.
    pub fn withhold_partition_nodes(mut self) -> Self {
        self.withhold_nodes = true;
        self
    }

    /// Fail the next `times` mount attempts on `target`.
    pub fn fail_mount(mut self, target: impl Into<PathBuf>, times: u32) -> Self {
        self.failing_mounts.insert(target.into(), times);
        self
    }

    pub fn mutation_count(&self) -> usize {
        self.calls.len()
    }

    pub fn count_calls(&self, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    pub fn open_mappings(&self) -> Vec<String> {
        self.mappings.keys().cloned().collect()
    }

    pub fn is_nocow(&self, path: &Path) -> bool {
        self.nocow.contains(path)
    }

    pub fn file(&self, path: &Path) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Drop every mount and swap, as after a reboot into the live ISO.
    pub fn unmount_all(&mut self) {
        self.mounts.clear();
        self.swaps.clear();
        self.mappings.clear();
    }

    fn insert_dir_all(&mut self, path: &Path) {
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            self.dirs.insert(ancestor.to_path_buf());
        }
    }

    fn new_uuid(&mut self) -> String {
        self.next_uuid += 1;
        format!("00000000-0000-4000-8000-{:012x}", self.next_uuid)
    }

    /// Partition lookup by node path: (disk, partition).
    fn partition_by_node(&self, node: &Path) -> Option<(&PathBuf, &FakeDisk, &FakePartition)> {
        self.disks.iter().find_map(|(disk_path, disk)| {
            disk.partitions
                .iter()
                .find(|p| partition_path(disk_path, p.number) == node)
                .map(|p| (disk_path, disk, p))
        })
    }

    fn mapping_for(&self, device: &Path) -> Option<&PathBuf> {
        let name = device.strip_prefix("/dev/mapper").ok()?.to_str()?;
        self.mappings.get(name)
    }

    /// Existence check without consuming pending polls.
    fn exists_now(&self, path: &Path) -> bool {
        if self.disks.contains_key(path) || self.mapping_for(path).is_some() {
            return true;
        }
        match self.partition_by_node(path) {
            Some((_, disk, _)) => {
                disk.nodes_visible && self.pending_polls.borrow().get(path).copied().unwrap_or(0) == 0
            }
            None => false,
        }
    }

    fn block_info(&self, device: &Path) -> Option<BlockInfo> {
        if let Some(container) = self.mapping_for(device) {
            return self.luks_inner.get(container).cloned();
        }
        let info = self.signatures.get(device).cloned();
        match self.partition_by_node(device) {
            Some((_, _, part)) => info.map(|mut i| {
                i.part_label = Some(part.name.clone());
                i
            }),
            None => info,
        }
    }

    fn mount_at(&self, target: &Path) -> Option<&ActiveMount> {
        self.mounts.iter().rev().find(|m| m.target == target)
    }

    fn fs_uuid_of_mount(&self, mount: &ActiveMount) -> Option<String> {
        self.block_info(&mount.source).and_then(|i| i.uuid)
    }

    fn normalize_options(fs_type: &str, options: &str, subvol: &str) -> String {
        let mut words = vec!["rw".to_string()];
        words.extend(
            options
                .split(',')
                .filter(|w| {
                    !w.is_empty()
                        && *w != "defaults"
                        && !w.starts_with("subvol=")
                        && !w.starts_with("subvolid=")
                })
                .map(str::to_string),
        );
        if fs_type == "btrfs" {
            words.push(format!("subvol=/{}", subvol));
        }
        words.join(",")
    }
}

impl BlockProbe for FakeDevices {
    fn is_block_device(&self, path: &Path) -> bool {
        if let Some((_, disk, _)) = self.partition_by_node(path) {
            if !disk.nodes_visible {
                return false;
            }
            let mut pending = self.pending_polls.borrow_mut();
            if let Some(remaining) = pending.get_mut(path) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return false;
                }
            }
            return true;
        }
        self.exists_now(path)
    }

    fn device_size(&self, device: &Path) -> Result<u64> {
        if let Some(disk) = self.disks.get(device) {
            return Ok(disk.size);
        }
        if let Some(container) = self.mapping_for(device) {
            return Ok(self.device_size(container)?.saturating_sub(LUKS2_HEADER));
        }
        match self.partition_by_node(device) {
            Some((_, _, part)) => Ok((part.end_mib - part.start_mib) * MIB),
            None => Err(ProvisionError::DeviceNotFound {
                device: device.to_path_buf(),
            }),
        }
    }

    fn probe(&self, device: &Path) -> Result<Option<BlockInfo>> {
        if !self.exists_now(device) {
            return Err(ProvisionError::DeviceNotFound {
                device: device.to_path_buf(),
            });
        }
        Ok(self.block_info(device))
    }

    fn mounts(&self) -> Result<Vec<ActiveMount>> {
        Ok(self.mounts.clone())
    }

    fn active_swaps(&self) -> Result<Vec<PathBuf>> {
        Ok(self.swaps.clone())
    }

    fn holders(&self, device: &Path) -> Result<Vec<String>> {
        Ok(self
            .mappings
            .iter()
            .filter(|(_, container)| container.as_path() == device)
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn partitions_of(&self, disk: &Path) -> Result<Vec<PathBuf>> {
        Ok(self
            .disks
            .get(disk)
            .filter(|d| d.nodes_visible)
            .map(|d| {
                d.partitions
                    .iter()
                    .map(|p| partition_path(disk, p.number))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_subvolumes(&self, mount: &Path) -> Result<Vec<String>> {
        let active = self
            .mount_at(mount)
            .ok_or_else(|| fail(format!("btrfs subvolume list {}", mount.display()), "not a btrfs mount"))?;
        let uuid = self.fs_uuid_of_mount(active).unwrap_or_default();
        Ok(self
            .subvolumes
            .get(&uuid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn free_space(&self, mount: &Path) -> Result<u64> {
        let active = self.mount_at(mount).ok_or_else(|| ProvisionError::DeviceNotFound {
            device: mount.to_path_buf(),
        })?;
        self.device_size(&active.source)
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.dirs.contains(path) || self.files.contains_key(path) || self.exists_now(path)
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.files.get(path).cloned())
    }

    fn dir_entries(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let entries: BTreeSet<PathBuf> = self
            .dirs
            .iter()
            .chain(self.files.keys())
            .filter(|p| p.parent() == Some(path) && p.as_path() != path)
            .cloned()
            .collect();
        Ok(entries.into_iter().collect())
    }
}

impl DeviceOps for FakeDevices {
    fn wipe_signatures(&mut self, device: &Path) -> Result<()> {
        self.calls.push(DeviceCall::WipeSignatures(device.to_path_buf()));
        if !self.exists_now(device) {
            return Err(ProvisionError::DeviceNotFound {
                device: device.to_path_buf(),
            });
        }
        if let Some(disk) = self.disks.get_mut(device) {
            let nodes: Vec<PathBuf> = disk
                .partitions
                .iter()
                .map(|p| partition_path(device, p.number))
                .collect();
            disk.table = None;
            disk.partitions.clear();
            disk.nodes_visible = false;
            for node in nodes {
                self.signatures.remove(&node);
                self.luks_inner.remove(&node);
            }
        }
        self.signatures.remove(device);
        Ok(())
    }

    fn create_partition_table(&mut self, disk: &Path, table: TableType) -> Result<()> {
        self.calls.push(DeviceCall::CreatePartitionTable(disk.to_path_buf()));
        let entry = self.disks.get_mut(disk).ok_or_else(|| ProvisionError::DeviceNotFound {
            device: disk.to_path_buf(),
        })?;
        entry.table = Some(table);
        entry.partitions.clear();
        entry.nodes_visible = false;
        Ok(())
    }

    fn create_partition(&mut self, disk: &Path, partition: &NewPartition) -> Result<()> {
        self.calls.push(DeviceCall::CreatePartition {
            disk: disk.to_path_buf(),
            number: partition.number,
            name: partition.name.clone(),
        });
        let cmd = format!("parted --script {} mkpart {}", disk.display(), partition.name);
        let entry = self.disks.get_mut(disk).ok_or_else(|| ProvisionError::DeviceNotFound {
            device: disk.to_path_buf(),
        })?;
        if entry.table.is_none() {
            return Err(fail(cmd, "unrecognised disk label"));
        }
        let last_usable = entry.size / MIB - 1;
        let end_mib = partition.end_mib.unwrap_or(last_usable);
        if partition.start_mib >= end_mib || end_mib > last_usable {
            return Err(fail(cmd, "the location is outside of the device"));
        }
        if entry
            .partitions
            .iter()
            .any(|p| partition.start_mib < p.end_mib && p.start_mib < end_mib)
        {
            return Err(fail(cmd, "can't have overlapping partitions"));
        }
        entry.partitions.push(FakePartition {
            number: partition.number,
            name: partition.name.clone(),
            start_mib: partition.start_mib,
            end_mib,
        });
        Ok(())
    }

    fn reread_partitions(&mut self, disk: &Path) -> Result<()> {
        self.calls.push(DeviceCall::RereadPartitions(disk.to_path_buf()));
        let delay = self.node_delay;
        let withhold = self.withhold_nodes;
        let entry = self.disks.get_mut(disk).ok_or_else(|| ProvisionError::DeviceNotFound {
            device: disk.to_path_buf(),
        })?;
        if withhold {
            return Ok(());
        }
        entry.nodes_visible = true;
        let mut pending = self.pending_polls.borrow_mut();
        for part in &entry.partitions {
            pending.insert(partition_path(disk, part.number), delay);
        }
        Ok(())
    }

    fn format(&mut self, device: &Path, request: &FormatRequest) -> Result<()> {
        self.calls.push(DeviceCall::Format {
            device: device.to_path_buf(),
            fs: request.fs,
        });
        if !self.exists_now(device) {
            return Err(ProvisionError::DeviceNotFound {
                device: device.to_path_buf(),
            });
        }
        let uuid = self.new_uuid();
        let info = BlockInfo {
            fs_type: Some(request.fs.blkid_type().to_string()),
            uuid: Some(uuid.clone()),
            label: Some(request.label.clone()),
            part_label: None,
        };
        if request.fs == FsType::Btrfs {
            self.subvolumes.insert(uuid, BTreeSet::new());
        }
        match self.mapping_for(device).cloned() {
            Some(container) => {
                self.luks_inner.insert(container, info);
            }
            None => {
                self.luks_inner.remove(device);
                self.signatures.insert(device.to_path_buf(), info);
            }
        }
        Ok(())
    }

    fn luks_format(
        &mut self,
        device: &Path,
        _spec: &EncryptionSpec,
        label: &str,
        _key_file: &Path,
    ) -> Result<()> {
        self.calls.push(DeviceCall::LuksFormat(device.to_path_buf()));
        if !self.exists_now(device) {
            return Err(ProvisionError::DeviceNotFound {
                device: device.to_path_buf(),
            });
        }
        let uuid = self.new_uuid();
        self.luks_inner.remove(device);
        self.signatures.insert(
            device.to_path_buf(),
            BlockInfo {
                fs_type: Some(LUKS_TYPE.to_string()),
                uuid: Some(uuid),
                label: Some(label.to_string()),
                part_label: None,
            },
        );
        Ok(())
    }

    fn luks_open(&mut self, device: &Path, name: &str, _key_file: &Path) -> Result<()> {
        self.calls.push(DeviceCall::LuksOpen {
            device: device.to_path_buf(),
            name: name.to_string(),
        });
        let cmd = format!("cryptsetup open {} {}", device.display(), name);
        if !self.block_info(device).is_some_and(|i| i.is_luks()) {
            return Err(fail(cmd, format!("Device {} is not a valid LUKS device.", device.display())));
        }
        if self.mappings.contains_key(name) {
            return Err(fail(cmd, format!("Device {} already exists.", name)));
        }
        self.mappings.insert(name.to_string(), device.to_path_buf());
        Ok(())
    }

    fn luks_close(&mut self, name: &str) -> Result<()> {
        self.calls.push(DeviceCall::LuksClose(name.to_string()));
        let cmd = format!("cryptsetup close {}", name);
        let mapped = mapper_path(name);
        if !self.mappings.contains_key(name) {
            return Err(fail(cmd, format!("Device {} is not active.", name)));
        }
        if self.mounts.iter().any(|m| m.source == mapped) {
            return Err(fail(cmd, format!("Device {} is still in use.", name)));
        }
        self.mappings.remove(name);
        Ok(())
    }

    fn create_subvolume(&mut self, path: &Path) -> Result<()> {
        self.calls.push(DeviceCall::CreateSubvolume(path.to_path_buf()));
        let cmd = format!("btrfs subvolume create {}", path.display());
        let mount = self
            .mounts
            .iter()
            .filter(|m| m.fs_type == "btrfs" && path.starts_with(&m.target))
            .max_by_key(|m| m.target.components().count())
            .cloned()
            .ok_or_else(|| fail(&cmd, "not a btrfs filesystem"))?;
        let rel = path
            .strip_prefix(&mount.target)
            .map_err(|_| fail(&cmd, "path outside mount"))?;
        let base = mount.subvolume().unwrap_or_default();
        let name = if base.is_empty() {
            rel.display().to_string()
        } else {
            format!("{}/{}", base, rel.display())
        };
        let uuid = self
            .fs_uuid_of_mount(&mount)
            .ok_or_else(|| fail(&cmd, "filesystem has no UUID"))?;
        let set = self.subvolumes.entry(uuid).or_default();
        if !set.insert(name) {
            return Err(fail(cmd, "target path already exists"));
        }
        self.insert_dir_all(path);
        Ok(())
    }

    fn set_nocow(&mut self, path: &Path) -> Result<()> {
        self.calls.push(DeviceCall::SetNoCow(path.to_path_buf()));
        if !self.path_exists(path) {
            return Err(fail(
                format!("chattr +C {}", path.display()),
                "No such file or directory",
            ));
        }
        self.nocow.insert(path.to_path_buf());
        Ok(())
    }

    fn mount(&mut self, source: &Path, target: &Path, fs_type: &str, options: &str) -> Result<()> {
        self.calls.push(DeviceCall::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options: options.to_string(),
        });
        let cmd = format!(
            "mount -t {} -o {} {} {}",
            fs_type,
            options,
            source.display(),
            target.display()
        );

        if let Some(remaining) = self.failing_mounts.get_mut(target) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(fail(cmd, "exit code 32: mount: injected failure"));
            }
        }
        if !self.dirs.contains(target) {
            return Err(fail(cmd, "exit code 32: mount point does not exist"));
        }
        if !self.exists_now(source) {
            return Err(fail(cmd, "exit code 32: special device does not exist"));
        }
        let info = self.block_info(source).unwrap_or_default();
        if info.fs_type.as_deref() != Some(fs_type) {
            return Err(fail(cmd, "exit code 32: wrong fs type, bad option, bad superblock"));
        }
        if self.mount_at(target).is_some() {
            return Err(fail(cmd, "exit code 32: target is already mounted"));
        }

        let requested = options
            .split(',')
            .find_map(|o| o.strip_prefix("subvol="))
            .map(|s| s.trim_matches('/').to_string())
            .unwrap_or_default();
        if fs_type == "btrfs" && !requested.is_empty() {
            let uuid = info.uuid.clone().unwrap_or_default();
            let known = self
                .subvolumes
                .get(&uuid)
                .is_some_and(|set| set.contains(&requested));
            if !known {
                return Err(fail(cmd, "exit code 32: No such file or directory"));
            }
        }

        self.mounts.push(ActiveMount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_string(),
            options: Self::normalize_options(fs_type, options, &requested),
        });
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        self.calls.push(DeviceCall::Unmount(target.to_path_buf()));
        let cmd = format!("umount {}", target.display());
        let idx = self
            .mounts
            .iter()
            .rposition(|m| m.target == target)
            .ok_or_else(|| fail(&cmd, "not mounted"))?;
        if self
            .mounts
            .iter()
            .any(|m| m.target != target && m.target.starts_with(target))
        {
            return Err(fail(cmd, "target is busy"));
        }
        self.mounts.remove(idx);
        Ok(())
    }

    fn swap_on(&mut self, device: &Path) -> Result<()> {
        self.calls.push(DeviceCall::SwapOn(device.to_path_buf()));
        let cmd = format!("swapon {}", device.display());
        let is_swap = self
            .block_info(device)
            .is_some_and(|i| i.fs_type.as_deref() == Some("swap"));
        if !is_swap {
            return Err(fail(cmd, "read swap header failed"));
        }
        if self.swaps.iter().any(|s| s == device) {
            return Err(fail(cmd, "Device or resource busy"));
        }
        self.swaps.push(device.to_path_buf());
        Ok(())
    }

    fn create_dir_all(&mut self, path: &Path) -> Result<()> {
        self.calls.push(DeviceCall::CreateDir(path.to_path_buf()));
        if self.files.contains_key(path) {
            return Err(ProvisionError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", path.display()),
            )));
        }
        self.insert_dir_all(path);
        Ok(())
    }

    fn write_file_atomic(&mut self, path: &Path, contents: &str) -> Result<()> {
        self.calls.push(DeviceCall::WriteFile(path.to_path_buf()));
        let parent_exists = path.parent().is_some_and(|p| self.dirs.contains(p));
        if !parent_exists {
            return Err(ProvisionError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("parent directory of {} does not exist", path.display()),
            )));
        }
        self.files.insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn move_entry(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.calls.push(DeviceCall::MoveEntry {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        });
        let cmd = format!("mv --no-clobber {} {}", from.display(), to.display());
        if self.dirs.contains(to) || self.files.contains_key(to) {
            return Err(fail(cmd, "destination exists"));
        }
        if !self.dirs.contains(from) && !self.files.contains_key(from) {
            return Err(fail(cmd, "No such file or directory"));
        }

        let rebase = |p: &Path| -> Option<PathBuf> { p.strip_prefix(from).ok().map(|rel| to.join(rel)) };

        let moved_dirs: Vec<PathBuf> = self.dirs.iter().filter(|d| d.starts_with(from)).cloned().collect();
        for dir in moved_dirs {
            self.dirs.remove(&dir);
            if let Some(new) = rebase(&dir) {
                self.dirs.insert(new);
            }
        }
        let moved_files: Vec<PathBuf> = self.files.keys().filter(|f| f.starts_with(from)).cloned().collect();
        for file in moved_files {
            if let (Some(contents), Some(new)) = (self.files.remove(&file), rebase(&file)) {
                self.files.insert(new, contents);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::size::GIB;

    fn disk_with_partition() -> FakeDevices {
        let mut fake = FakeDevices::new().with_disk("/dev/vda", 16 * GIB);
        let disk = Path::new("/dev/vda");
        fake.create_partition_table(disk, TableType::Gpt).expect("mklabel"); // test: fake backend
        fake.create_partition(
            disk,
            &NewPartition {
                number: 1,
                name: "ROOT".to_string(),
                fs: FsType::Btrfs,
                start_mib: 1,
                end_mib: None,
                esp: false,
            },
        )
        .expect("mkpart");
        fake
    }

    #[test]
    fn test_nodes_appear_after_reread() {
        let mut fake = disk_with_partition().with_node_delay(2);
        let node = Path::new("/dev/vda1");
        assert!(!fake.is_block_device(node));

        fake.reread_partitions(Path::new("/dev/vda")).expect("reread");
        assert!(!fake.is_block_device(node));
        assert!(!fake.is_block_device(node));
        assert!(fake.is_block_device(node));
    }

    #[test]
    fn test_overlapping_partition_rejected() {
        let mut fake = disk_with_partition();
        let err = fake
            .create_partition(
                Path::new("/dev/vda"),
                &NewPartition {
                    number: 2,
                    name: "X".to_string(),
                    fs: FsType::Swap,
                    start_mib: 100,
                    end_mib: Some(200),
                    esp: false,
                },
            )
            .expect_err("overlaps partition 1");
        assert!(err.to_string().contains("overlapping"));
    }

    #[test]
    fn test_luks_mapping_lifecycle() {
        let mut fake = disk_with_partition();
        fake.reread_partitions(Path::new("/dev/vda")).expect("reread");
        let node = Path::new("/dev/vda1");
        let key = Path::new("/tmp/key");
        fake.luks_format(node, &EncryptionSpec::default(), "ROOT", key)
            .expect("luksFormat");
        fake.luks_open(node, "cryptroot", key).expect("open");
        assert_eq!(fake.holders(node).expect("holders"), vec!["cryptroot"]);

        let mapped = mapper_path("cryptroot");
        fake.format(
            &mapped,
            &FormatRequest {
                fs: FsType::Btrfs,
                label: "ROOT".to_string(),
                checksum: None,
                node_size: None,
            },
        )
        .expect("mkfs");
        fake.luks_close("cryptroot").expect("close");

        // Container keeps its LUKS signature; inner fs survives a reopen
        assert!(fake.probe(node).expect("probe").expect("sig").is_luks());
        fake.luks_open(node, "cryptroot", key).expect("reopen");
        let inner = fake.probe(&mapped).expect("probe").expect("inner fs");
        assert_eq!(inner.fs_type.as_deref(), Some("btrfs"));
    }

    #[test]
    fn test_subvolume_mount_requires_subvolume() {
        let mut fake = disk_with_partition().with_dir("/mnt");
        fake.reread_partitions(Path::new("/dev/vda")).expect("reread");
        let node = Path::new("/dev/vda1");
        fake.format(
            node,
            &FormatRequest {
                fs: FsType::Btrfs,
                label: "ROOT".to_string(),
                checksum: None,
                node_size: None,
            },
        )
        .expect("mkfs");

        assert!(fake.mount(node, Path::new("/mnt"), "btrfs", "subvol=/@").is_err());

        fake.mount(node, Path::new("/mnt"), "btrfs", "subvolid=5").expect("top-level");
        fake.create_subvolume(Path::new("/mnt/@")).expect("subvolume");
        assert_eq!(fake.list_subvolumes(Path::new("/mnt")).expect("list"), vec!["@"]);
        fake.unmount(Path::new("/mnt")).expect("umount");

        fake.mount(node, Path::new("/mnt"), "btrfs", "subvol=/@,noatime")
            .expect("subvol mount");
        let mounts = fake.mounts().expect("mounts");
        assert_eq!(mounts[0].subvolume(), Some("@"));
    }

    #[test]
    fn test_move_entry_never_clobbers() {
        let mut fake = FakeDevices::new()
            .with_file("/home/alice/.bashrc", "x")
            .with_dir("/scratch/@home/alice");
        assert!(fake
            .move_entry(Path::new("/home/alice"), Path::new("/scratch/@home/alice"))
            .is_err());
        fake.move_entry(Path::new("/home/alice"), Path::new("/scratch/@home/bob"))
            .expect("move");
        assert_eq!(fake.file(Path::new("/scratch/@home/bob/.bashrc")), Some("x"));
        assert!(!fake.path_exists(Path::new("/home/alice")));
    }
}
