//! Real block device backend.
//!
//! Mutations shell out to the disk tools through `command_runner`; probes read
//! `/proc/self/mounts`, `/proc/swaps` and sysfs directly and use `blkid -p`
//! for signatures.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::statvfs::statvfs;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{ActiveMount, BlockInfo, BlockProbe, DeviceOps, FormatRequest, NewPartition};
use crate::command_runner::{run_checked, run_command};
use crate::commands::disk::{
    BlkidArgs, BlockSizeArgs, MakeLabelArgs, MakePartitionArgs, PartprobeArgs, SetEspFlagArgs,
    UdevSettleArgs, WipeSignaturesArgs, parse_blkid_export,
};
use crate::commands::encryption::{LuksCloseArgs, LuksFormatArgs, LuksOpenArgs};
use crate::commands::filesystem::{
    MkfsBtrfsArgs, MkfsFatArgs, MkswapArgs, MountArgs, MoveArgs, NoCowArgs, SubvolumeCreateArgs,
    SubvolumeListArgs, SwaponArgs, UmountArgs, parse_subvolume_list,
};
use crate::error::{ProvisionError, Result};
use crate::mount_table::unescape_field;
use crate::plan::EncryptionSpec;
use crate::types::{FsType, TableType};

const PROC_MOUNTS: &str = "/proc/self/mounts";
const PROC_SWAPS: &str = "/proc/swaps";
const SYS_BLOCK: &str = "/sys/class/block";

/// Backend that talks to the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDevices;

impl SystemDevices {
    pub fn new() -> Self {
        Self
    }
}

/// Parse `/proc/mounts`-format text.
pub fn parse_mounts(table: &str) -> Vec<ActiveMount> {
    table
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let source = parts.next()?;
            let target = parts.next()?;
            let fs_type = parts.next()?;
            let options = parts.next()?;
            Some(ActiveMount {
                source: PathBuf::from(unescape_field(source)),
                target: PathBuf::from(unescape_field(target)),
                fs_type: fs_type.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Parse `/proc/swaps`; the first line is a header.
pub fn parse_swaps(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(|dev| PathBuf::from(unescape_field(dev)))
        .collect()
}

fn block_name(device: &Path) -> Option<String> {
    let resolved = fs::canonicalize(device).unwrap_or_else(|_| device.to_path_buf());
    resolved.file_name().map(|n| n.to_string_lossy().into_owned())
}

impl BlockProbe for SystemDevices {
    fn is_block_device(&self, path: &Path) -> bool {
        fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    fn device_size(&self, device: &Path) -> Result<u64> {
        let out = run_checked(&BlockSizeArgs {
            device: device.to_path_buf(),
        })?;
        out.stdout
            .trim()
            .parse()
            .map_err(|e| ProvisionError::command(&out.command_line, format!("unparseable size: {}", e)))
    }

    fn probe(&self, device: &Path) -> Result<Option<BlockInfo>> {
        let out = run_command(&BlkidArgs {
            device: device.to_path_buf(),
        })?;
        // blkid exits 2 when nothing was detected
        if out.exit_code == Some(2) {
            debug!("blkid: no signature on {}", device.display());
            return Ok(None);
        }
        out.ensure_success()?;

        let mut info = BlockInfo::default();
        for (key, value) in parse_blkid_export(&out.stdout) {
            match key.as_str() {
                "TYPE" => info.fs_type = Some(value),
                "UUID" => info.uuid = Some(value),
                "LABEL" => info.label = Some(value),
                "PART_ENTRY_NAME" | "PARTLABEL" => info.part_label = Some(value),
                _ => {}
            }
        }
        if info.fs_type.is_none() && info.uuid.is_none() {
            return Ok(None);
        }
        Ok(Some(info))
    }

    fn mounts(&self) -> Result<Vec<ActiveMount>> {
        Ok(parse_mounts(&fs::read_to_string(PROC_MOUNTS)?))
    }

    fn active_swaps(&self) -> Result<Vec<PathBuf>> {
        Ok(parse_swaps(&fs::read_to_string(PROC_SWAPS)?))
    }

    fn holders(&self, device: &Path) -> Result<Vec<String>> {
        let Some(name) = block_name(device) else {
            return Ok(Vec::new());
        };
        let dir = Path::new(SYS_BLOCK).join(&name).join("holders");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut holders = Vec::new();
        for entry in entries {
            let holder = entry?.file_name().to_string_lossy().into_owned();
            // Prefer the device-mapper name over dm-N
            let dm_name = fs::read_to_string(Path::new(SYS_BLOCK).join(&holder).join("dm/name"))
                .map(|s| s.trim().to_string())
                .unwrap_or(holder);
            holders.push(dm_name);
        }
        holders.sort();
        Ok(holders)
    }

    fn partitions_of(&self, disk: &Path) -> Result<Vec<PathBuf>> {
        let Some(name) = block_name(disk) else {
            return Ok(Vec::new());
        };
        let dir = Path::new("/sys/block").join(&name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut parts = Vec::new();
        for entry in entries {
            let entry = entry?;
            let child = entry.file_name().to_string_lossy().into_owned();
            if child.starts_with(&name) && entry.path().join("partition").exists() {
                parts.push(PathBuf::from("/dev").join(child));
            }
        }
        parts.sort();
        Ok(parts)
    }

    fn list_subvolumes(&self, mount: &Path) -> Result<Vec<String>> {
        let out = run_checked(&SubvolumeListArgs {
            mount: mount.to_path_buf(),
        })?;
        Ok(parse_subvolume_list(&out.stdout))
    }

    fn free_space(&self, mount: &Path) -> Result<u64> {
        let stat = statvfs(mount).map_err(std::io::Error::from)?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_file(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn dir_entries(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }
}

impl DeviceOps for SystemDevices {
    fn wipe_signatures(&mut self, device: &Path) -> Result<()> {
        run_checked(&WipeSignaturesArgs {
            device: device.to_path_buf(),
        })?;
        Ok(())
    }

    fn create_partition_table(&mut self, disk: &Path, table: TableType) -> Result<()> {
        run_checked(&MakeLabelArgs {
            device: disk.to_path_buf(),
            table,
        })?;
        Ok(())
    }

    fn create_partition(&mut self, disk: &Path, partition: &NewPartition) -> Result<()> {
        run_checked(&MakePartitionArgs {
            device: disk.to_path_buf(),
            name: partition.name.clone(),
            fs: partition.fs,
            start_mib: partition.start_mib,
            end_mib: partition.end_mib,
        })?;
        if partition.esp {
            run_checked(&SetEspFlagArgs {
                device: disk.to_path_buf(),
                number: partition.number,
            })?;
        }
        Ok(())
    }

    fn reread_partitions(&mut self, disk: &Path) -> Result<()> {
        run_checked(&PartprobeArgs {
            device: disk.to_path_buf(),
        })?;
        run_checked(&UdevSettleArgs)?;
        Ok(())
    }

    fn format(&mut self, device: &Path, request: &FormatRequest) -> Result<()> {
        let device = device.to_path_buf();
        let label = request.label.clone();
        match request.fs {
            FsType::Vfat => run_checked(&MkfsFatArgs { device, label })?,
            FsType::Btrfs => run_checked(&MkfsBtrfsArgs {
                device,
                label,
                checksum: request.checksum,
                node_size: request.node_size,
            })?,
            FsType::Swap => run_checked(&MkswapArgs { device, label })?,
        };
        Ok(())
    }

    fn luks_format(
        &mut self,
        device: &Path,
        spec: &EncryptionSpec,
        label: &str,
        key_file: &Path,
    ) -> Result<()> {
        run_checked(&LuksFormatArgs {
            device: device.to_path_buf(),
            cipher: spec.cipher,
            key_size: spec.key_size(),
            hash: spec.hash,
            pbkdf: spec.pbkdf,
            key_file: key_file.to_path_buf(),
            label: Some(label.to_string()),
        })?;
        Ok(())
    }

    fn luks_open(&mut self, device: &Path, name: &str, key_file: &Path) -> Result<()> {
        run_checked(&LuksOpenArgs {
            device: device.to_path_buf(),
            mapper_name: name.to_string(),
            key_file: key_file.to_path_buf(),
        })?;
        Ok(())
    }

    fn luks_close(&mut self, name: &str) -> Result<()> {
        run_checked(&LuksCloseArgs {
            mapper_name: name.to_string(),
        })?;
        Ok(())
    }

    fn create_subvolume(&mut self, path: &Path) -> Result<()> {
        run_checked(&SubvolumeCreateArgs {
            path: path.to_path_buf(),
        })?;
        Ok(())
    }

    fn set_nocow(&mut self, path: &Path) -> Result<()> {
        run_checked(&NoCowArgs {
            path: path.to_path_buf(),
        })?;
        Ok(())
    }

    fn mount(&mut self, source: &Path, target: &Path, fs_type: &str, options: &str) -> Result<()> {
        run_checked(&MountArgs {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: fs_type.to_string(),
            options: options.to_string(),
        })?;
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        run_checked(&UmountArgs {
            target: target.to_path_buf(),
        })?;
        Ok(())
    }

    fn swap_on(&mut self, device: &Path) -> Result<()> {
        run_checked(&SwaponArgs {
            device: device.to_path_buf(),
        })?;
        Ok(())
    }

    fn create_dir_all(&mut self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn write_file_atomic(&mut self, path: &Path, contents: &str) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            ProvisionError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no parent directory", path.display()),
            ))
        })?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))?;
        tmp.persist(path).map_err(|e| ProvisionError::Io(e.error))?;

        info!("wrote {}", path.display());
        Ok(())
    }

    fn move_entry(&mut self, from: &Path, to: &Path) -> Result<()> {
        if to.exists() {
            return Err(ProvisionError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", to.display()),
            )));
        }
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
                run_checked(&MoveArgs {
                    from: from.to_path_buf(),
                    to: to.to_path_buf(),
                })?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mounts_unescapes_whitespace() {
        let table = "/dev/sdb1 /media/LOCK\\040CHAIN ext4 rw 0 0\n\
                     /dev/mapper/crypthome /home btrfs rw,noatime,subvolid=257,subvol=/@home 0 0\n";
        let mounts = parse_mounts(table);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].target, PathBuf::from("/media/LOCK CHAIN"));
        assert_eq!(mounts[1].subvolume(), Some("@home"));
    }

    #[test]
    fn test_parse_swaps_skips_header() {
        let table = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n\
                     /dev/sdc1                               partition\t33554428\t0\t\t-2\n";
        assert_eq!(parse_swaps(table), vec![PathBuf::from("/dev/sdc1")]);
    }

    #[test]
    fn test_write_file_atomic_replaces_contents() {
        let dir = tempfile::tempdir().expect("tempdir"); // test: scratch dir
        let path = dir.path().join("fstab");
        fs::write(&path, "old\n").expect("seed");

        let mut sys = SystemDevices::new();
        sys.write_file_atomic(&path, "new\n").expect("atomic write");
        assert_eq!(fs::read_to_string(&path).expect("read back"), "new\n");
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_move_entry_refuses_existing_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        fs::write(&from, "1").expect("seed a");
        fs::write(&to, "2").expect("seed b");

        let mut sys = SystemDevices::new();
        assert!(sys.move_entry(&from, &to).is_err());
        assert_eq!(fs::read_to_string(&to).expect("b intact"), "2");

        fs::remove_file(&to).expect("clear b");
        sys.move_entry(&from, &to).expect("rename");
        assert!(!from.exists());
    }
}
