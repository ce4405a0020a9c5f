//! Block device capabilities.
//!
//! Everything that touches a disk goes through one of two traits:
//!
//! - [`BlockProbe`]: read-only queries (blkid, /proc/mounts, sysfs). The
//!   verifier only ever receives this trait.
//! - [`DeviceOps`]: mutating operations (wipe, partition, format, mount).
//!   Only the executor and the repair helper hold it.
//!
//! [`system::SystemDevices`] shells out to the real tools;
//! [`fake::FakeDevices`] is an in-memory backend that records every call.

pub mod fake;
pub mod system;

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::plan::EncryptionSpec;
use crate::types::{ChecksumAlgo, FsType, TableType};

/// blkid `TYPE=` value for a LUKS header.
pub const LUKS_TYPE: &str = "crypto_LUKS";

/// What blkid reports about a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub fs_type: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub part_label: Option<String>,
}

impl BlockInfo {
    pub fn is_luks(&self) -> bool {
        self.fs_type.as_deref() == Some(LUKS_TYPE)
    }
}

/// One line of the kernel mount table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fs_type: String,
    pub options: String,
}

impl ActiveMount {
    /// The `subvol=` path the kernel reports, without the leading slash.
    pub fn subvolume(&self) -> Option<&str> {
        self.options
            .split(',')
            .find_map(|opt| opt.strip_prefix("subvol="))
            .map(|s| s.trim_start_matches('/'))
    }
}

/// A partition to create, in MiB offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPartition {
    pub number: u32,
    pub name: String,
    pub fs: FsType,
    pub start_mib: u64,
    /// `None` extends to the end of the disk
    pub end_mib: Option<u64>,
    pub esp: bool,
}

/// A filesystem to create on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatRequest {
    pub fs: FsType,
    pub label: String,
    pub checksum: Option<ChecksumAlgo>,
    pub node_size: Option<u64>,
}

/// Read-only view of block devices and mounts.
pub trait BlockProbe {
    fn is_block_device(&self, path: &Path) -> bool;

    /// Size in bytes.
    fn device_size(&self, device: &Path) -> Result<u64>;

    /// Filesystem/LUKS signature, `None` when the device carries none.
    fn probe(&self, device: &Path) -> Result<Option<BlockInfo>>;

    fn mounts(&self) -> Result<Vec<ActiveMount>>;

    /// Devices currently used as swap.
    fn active_swaps(&self) -> Result<Vec<PathBuf>>;

    /// Device-mapper names holding `device` open.
    fn holders(&self, device: &Path) -> Result<Vec<String>>;

    /// Partition nodes currently present for `disk`.
    fn partitions_of(&self, disk: &Path) -> Result<Vec<PathBuf>>;

    /// Subvolume paths of the btrfs filesystem mounted at `mount`.
    fn list_subvolumes(&self, mount: &Path) -> Result<Vec<String>>;

    /// Bytes available to unprivileged users on the filesystem at `mount`.
    fn free_space(&self, mount: &Path) -> Result<u64>;

    fn path_exists(&self, path: &Path) -> bool;

    /// File contents, `None` if the file does not exist.
    fn read_file(&self, path: &Path) -> Result<Option<String>>;

    fn dir_entries(&self, path: &Path) -> Result<Vec<PathBuf>>;
}

/// Mutating device operations.
///
/// Each call is one blocking external operation; implementations never retry.
pub trait DeviceOps: BlockProbe {
    fn wipe_signatures(&mut self, device: &Path) -> Result<()>;
    fn create_partition_table(&mut self, disk: &Path, table: TableType) -> Result<()>;
    fn create_partition(&mut self, disk: &Path, partition: &NewPartition) -> Result<()>;
    /// Ask the kernel to re-read the partition table and let udev settle.
    fn reread_partitions(&mut self, disk: &Path) -> Result<()>;
    fn format(&mut self, device: &Path, request: &FormatRequest) -> Result<()>;
    fn luks_format(
        &mut self,
        device: &Path,
        spec: &EncryptionSpec,
        label: &str,
        key_file: &Path,
    ) -> Result<()>;
    fn luks_open(&mut self, device: &Path, name: &str, key_file: &Path) -> Result<()>;
    fn luks_close(&mut self, name: &str) -> Result<()>;
    fn create_subvolume(&mut self, path: &Path) -> Result<()>;
    /// Disable copy-on-write (`chattr +C`).
    fn set_nocow(&mut self, path: &Path) -> Result<()>;
    fn mount(&mut self, source: &Path, target: &Path, fs_type: &str, options: &str) -> Result<()>;
    fn unmount(&mut self, target: &Path) -> Result<()>;
    fn swap_on(&mut self, device: &Path) -> Result<()>;
    fn create_dir_all(&mut self, path: &Path) -> Result<()>;
    /// Replace `path` with `contents` via a temp file in the same directory.
    fn write_file_atomic(&mut self, path: &Path, contents: &str) -> Result<()>;
    /// Move a file or directory; fails if `to` already exists.
    fn move_entry(&mut self, from: &Path, to: &Path) -> Result<()>;
}

/// Generate a partition device path from a disk path and partition number.
///
/// Handles both `/dev/sdX` → `/dev/sdX1` and `/dev/nvme0n1` → `/dev/nvme0n1p1` patterns.
pub fn partition_path(disk: &Path, partition_num: u32) -> PathBuf {
    let disk_str = disk.display().to_string();

    // NVMe, mmcblk and loop devices use 'p' separator
    if disk_str.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk_str, partition_num))
    } else {
        PathBuf::from(format!("{}{}", disk_str, partition_num))
    }
}

pub fn mapper_path(name: &str) -> PathBuf {
    PathBuf::from("/dev/mapper").join(name)
}

/// Why `disk` cannot be wiped right now, if anything holds it.
pub fn device_busy_reason<P: BlockProbe + ?Sized>(probe: &P, disk: &Path) -> Result<Option<String>> {
    let mut nodes = vec![disk.to_path_buf()];
    nodes.extend(probe.partitions_of(disk)?);

    let mounts = probe.mounts()?;
    for node in &nodes {
        if let Some(m) = mounts.iter().find(|m| &m.source == node) {
            return Ok(Some(format!(
                "{} is mounted at {}",
                node.display(),
                m.target.display()
            )));
        }
    }

    let swaps = probe.active_swaps()?;
    if let Some(node) = nodes.iter().find(|n| swaps.contains(n)) {
        return Ok(Some(format!("{} is active swap", node.display())));
    }

    for node in &nodes {
        let holders = probe.holders(node)?;
        if !holders.is_empty() {
            return Ok(Some(format!(
                "{} is held by {}",
                node.display(),
                holders.join(", ")
            )));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_path_sda() {
        assert_eq!(
            partition_path(Path::new("/dev/sda"), 2),
            PathBuf::from("/dev/sda2")
        );
    }

    #[test]
    fn test_partition_path_nvme() {
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 1),
            PathBuf::from("/dev/nvme0n1p1")
        );
        assert_eq!(
            partition_path(Path::new("/dev/loop7"), 3),
            PathBuf::from("/dev/loop7p3")
        );
    }

    #[test]
    fn test_active_mount_subvolume() {
        let m = ActiveMount {
            source: PathBuf::from("/dev/sda2"),
            target: PathBuf::from("/home"),
            fs_type: "btrfs".to_string(),
            options: "rw,noatime,compress=zstd:3,subvolid=257,subvol=/@home".to_string(),
        };
        assert_eq!(m.subvolume(), Some("@home"));

        let top = ActiveMount {
            options: "rw,subvolid=5,subvol=/".to_string(),
            ..m
        };
        assert_eq!(top.subvolume(), Some(""));
    }

    #[test]
    fn test_busy_reason_mounted_partition() {
        let mut fake = fake::FakeDevices::new().with_disk("/dev/sdb", 64 * crate::plan::size::GIB);
        fake.create_partition_table(Path::new("/dev/sdb"), TableType::Gpt)
            .expect("label"); // test: fake backend
        fake.create_partition(
            Path::new("/dev/sdb"),
            &NewPartition {
                number: 1,
                name: "DATA".to_string(),
                fs: FsType::Btrfs,
                start_mib: 1,
                end_mib: None,
                esp: false,
            },
        )
        .expect("mkpart");
        fake.reread_partitions(Path::new("/dev/sdb")).expect("reread");
        let node = PathBuf::from("/dev/sdb1");
        fake.format(
            &node,
            &FormatRequest {
                fs: FsType::Btrfs,
                label: "DATA".to_string(),
                checksum: None,
                node_size: None,
            },
        )
        .expect("format");
        assert_eq!(device_busy_reason(&fake, Path::new("/dev/sdb")).expect("probe"), None);

        fake.create_dir_all(Path::new("/srv")).expect("mkdir");
        fake.mount(&node, Path::new("/srv"), "btrfs", "defaults")
            .expect("mount");
        let reason = device_busy_reason(&fake, Path::new("/dev/sdb"))
            .expect("probe")
            .expect("busy");
        assert!(reason.contains("mounted at /srv"));
    }
}
