//! Typed arguments for partitioning and probing tools.
//!
//! - `WipeSignaturesArgs` for `wipefs`
//! - `MakeLabelArgs`, `MakePartitionArgs`, `SetEspFlagArgs` for `parted`
//! - `PartprobeArgs`, `UdevSettleArgs` for re-reading the partition table
//! - `BlockSizeArgs` for `blockdev --getsize64`
//! - `BlkidArgs` for `blkid -p -o export`

use std::path::PathBuf;

use crate::command_traits::CommandArgs;
use crate::types::{FsType, TableType};

/// Remove every filesystem, RAID and partition-table signature.
#[derive(Debug, Clone)]
pub struct WipeSignaturesArgs {
    pub device: PathBuf,
}

impl CommandArgs for WipeSignaturesArgs {
    fn program(&self) -> &'static str {
        "wipefs"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--all".to_string(),
            "--force".to_string(),
            self.device.display().to_string(),
        ]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `parted --script <disk> mklabel gpt`
#[derive(Debug, Clone)]
pub struct MakeLabelArgs {
    pub device: PathBuf,
    pub table: TableType,
}

impl CommandArgs for MakeLabelArgs {
    fn program(&self) -> &'static str {
        "parted"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--script".to_string(),
            self.device.display().to_string(),
            "mklabel".to_string(),
            self.table.to_string(),
        ]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `parted --script --align optimal <disk> mkpart <name> <fs> <start> <end>`
///
/// Offsets are in MiB; `end_mib = None` means "to the end of the disk".
#[derive(Debug, Clone)]
pub struct MakePartitionArgs {
    pub device: PathBuf,
    pub name: String,
    pub fs: FsType,
    pub start_mib: u64,
    pub end_mib: Option<u64>,
}

impl CommandArgs for MakePartitionArgs {
    fn program(&self) -> &'static str {
        "parted"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let end = match self.end_mib {
            Some(end) => format!("{}MiB", end),
            None => "100%".to_string(),
        };
        vec![
            "--script".to_string(),
            "--align".to_string(),
            "optimal".to_string(),
            self.device.display().to_string(),
            "mkpart".to_string(),
            self.name.clone(),
            self.fs.parted_hint().to_string(),
            format!("{}MiB", self.start_mib),
            end,
        ]
    }

    fn is_destructive(&self) -> bool {
        true
    }
}

/// `parted --script <disk> set <n> esp on`
#[derive(Debug, Clone)]
pub struct SetEspFlagArgs {
    pub device: PathBuf,
    pub number: u32,
}

impl CommandArgs for SetEspFlagArgs {
    fn program(&self) -> &'static str {
        "parted"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--script".to_string(),
            self.device.display().to_string(),
            "set".to_string(),
            self.number.to_string(),
            "esp".to_string(),
            "on".to_string(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct PartprobeArgs {
    pub device: PathBuf,
}

impl CommandArgs for PartprobeArgs {
    fn program(&self) -> &'static str {
        "partprobe"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.device.display().to_string()]
    }
}

#[derive(Debug, Clone, Default)]
pub struct UdevSettleArgs;

impl CommandArgs for UdevSettleArgs {
    fn program(&self) -> &'static str {
        "udevadm"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["settle".to_string()]
    }
}

/// Device size in bytes.
#[derive(Debug, Clone)]
pub struct BlockSizeArgs {
    pub device: PathBuf,
}

impl CommandArgs for BlockSizeArgs {
    fn program(&self) -> &'static str {
        "blockdev"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["--getsize64".to_string(), self.device.display().to_string()]
    }
}

/// Low-level probe, bypassing the blkid cache so freshly formatted
/// devices report their new UUID.
#[derive(Debug, Clone)]
pub struct BlkidArgs {
    pub device: PathBuf,
}

impl CommandArgs for BlkidArgs {
    fn program(&self) -> &'static str {
        "blkid"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            "-o".to_string(),
            "export".to_string(),
            self.device.display().to_string(),
        ]
    }
}

/// Parse `blkid -o export` output into `KEY=value` pairs.
pub fn parse_blkid_export(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        .collect()
}
