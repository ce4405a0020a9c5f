//! Typed arguments for filesystem, subvolume and mount tools.

use std::path::PathBuf;

use crate::command_traits::CommandArgs;
use crate::types::ChecksumAlgo;

/// `mkfs.fat -F 32 -n <label> <device>`
#[derive(Debug, Clone)]
pub struct MkfsFatArgs {
    pub device: PathBuf,
    pub label: String,
}

impl CommandArgs for MkfsFatArgs {
    fn program(&self) -> &'static str {
        "mkfs.fat"
    }

    fn to_cli_args(&self) -> Vec<String> {
        // FAT volume labels are at most 11 characters, upper case
        let label: String = self.label.to_uppercase().chars().take(11).collect();
        vec![
            "-F".to_string(),
            "32".to_string(),
            "-n".to_string(),
            label,
            self.device.display().to_string(),
        ]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `mkfs.btrfs -f -L <label> [--csum <algo>] [--nodesize <bytes>] <device>`
#[derive(Debug, Clone)]
pub struct MkfsBtrfsArgs {
    pub device: PathBuf,
    pub label: String,
    pub checksum: Option<ChecksumAlgo>,
    pub node_size: Option<u64>,
}

impl CommandArgs for MkfsBtrfsArgs {
    fn program(&self) -> &'static str {
        "mkfs.btrfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["-f".to_string(), "-L".to_string(), self.label.clone()];
        if let Some(csum) = self.checksum {
            args.push("--csum".to_string());
            args.push(csum.to_string());
        }
        if let Some(node_size) = self.node_size {
            args.push("--nodesize".to_string());
            args.push(node_size.to_string());
        }
        args.push(self.device.display().to_string());
        args
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct MkswapArgs {
    pub device: PathBuf,
    pub label: String,
}

impl CommandArgs for MkswapArgs {
    fn program(&self) -> &'static str {
        "mkswap"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-L".to_string(),
            self.label.clone(),
            self.device.display().to_string(),
        ]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `mount -t <fstype> -o <options> <source> <target>`
#[derive(Debug, Clone)]
pub struct MountArgs {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fs_type: String,
    pub options: String,
}

impl CommandArgs for MountArgs {
    fn program(&self) -> &'static str {
        "mount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["-t".to_string(), self.fs_type.clone()];
        if !self.options.is_empty() && self.options != "defaults" {
            args.push("-o".to_string());
            args.push(self.options.clone());
        }
        args.push(self.source.display().to_string());
        args.push(self.target.display().to_string());
        args
    }
}

#[derive(Debug, Clone)]
pub struct UmountArgs {
    pub target: PathBuf,
}

impl CommandArgs for UmountArgs {
    fn program(&self) -> &'static str {
        "umount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.target.display().to_string()]
    }
}

#[derive(Debug, Clone)]
pub struct SwaponArgs {
    pub device: PathBuf,
}

impl CommandArgs for SwaponArgs {
    fn program(&self) -> &'static str {
        "swapon"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.device.display().to_string()]
    }
}

/// `btrfs subvolume create <path>`
#[derive(Debug, Clone)]
pub struct SubvolumeCreateArgs {
    pub path: PathBuf,
}

impl CommandArgs for SubvolumeCreateArgs {
    fn program(&self) -> &'static str {
        "btrfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "subvolume".to_string(),
            "create".to_string(),
            self.path.display().to_string(),
        ]
    }
}

/// `btrfs subvolume list -o <mount>` lists subvolumes below a mounted path.
#[derive(Debug, Clone)]
pub struct SubvolumeListArgs {
    pub mount: PathBuf,
}

impl CommandArgs for SubvolumeListArgs {
    fn program(&self) -> &'static str {
        "btrfs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "subvolume".to_string(),
            "list".to_string(),
            self.mount.display().to_string(),
        ]
    }
}

/// Extract subvolume paths from `btrfs subvolume list` output.
///
/// Lines look like `ID 256 gen 9 top level 5 path @home`.
pub fn parse_subvolume_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_once(" path "))
        .map(|(_, path)| path.trim().to_string())
        .collect()
}

/// `chattr +C <path>` disables copy-on-write for new files under `path`.
#[derive(Debug, Clone)]
pub struct NoCowArgs {
    pub path: PathBuf,
}

impl CommandArgs for NoCowArgs {
    fn program(&self) -> &'static str {
        "chattr"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["+C".to_string(), self.path.display().to_string()]
    }
}

/// `mv --no-clobber <from> <to>`; crosses filesystem boundaries where
/// `rename(2)` cannot.
#[derive(Debug, Clone)]
pub struct MoveArgs {
    pub from: PathBuf,
    pub to: PathBuf,
}

impl CommandArgs for MoveArgs {
    fn program(&self) -> &'static str {
        "mv"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--no-clobber".to_string(),
            self.from.display().to_string(),
            self.to.display().to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mkfs_btrfs_features() {
        let args = MkfsBtrfsArgs {
            device: PathBuf::from("/dev/mapper/crypthome"),
            label: "HOME".to_string(),
            checksum: Some(ChecksumAlgo::Xxhash),
            node_size: Some(16384),
        };
        assert_eq!(
            args.command_line(),
            "mkfs.btrfs -f -L HOME --csum xxhash --nodesize 16384 /dev/mapper/crypthome"
        );
        assert!(args.is_destructive());
    }

    #[test]
    fn test_mkfs_fat_label_truncated() {
        let args = MkfsFatArgs {
            device: PathBuf::from("/dev/sda1"),
            label: "efi-system-partition".to_string(),
        };
        assert!(args.to_cli_args().contains(&"EFI-SYSTEM-".to_string()));
    }

    #[test]
    fn test_mount_defaults_omits_options() {
        let args = MountArgs {
            source: PathBuf::from("/dev/sda1"),
            target: PathBuf::from("/mnt/boot"),
            fs_type: "vfat".to_string(),
            options: "defaults".to_string(),
        };
        assert_eq!(args.command_line(), "mount -t vfat /dev/sda1 /mnt/boot");

        let args = MountArgs {
            options: "subvol=/@home,noatime".to_string(),
            fs_type: "btrfs".to_string(),
            ..args
        };
        assert!(args.command_line().contains("-o subvol=/@home,noatime"));
    }

    #[test]
    fn test_parse_subvolume_list() {
        let out = "ID 256 gen 10 top level 5 path @\nID 257 gen 11 top level 5 path @home\n";
        assert_eq!(parse_subvolume_list(out), vec!["@", "@home"]);
    }

    #[test]
    fn test_move_never_clobbers() {
        let args = MoveArgs {
            from: PathBuf::from("/home/alice"),
            to: PathBuf::from("/mnt/scratch/@home/alice"),
        };
        assert_eq!(args.to_cli_args()[0], "--no-clobber");
    }
}
