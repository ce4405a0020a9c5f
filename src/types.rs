//! Type-safe plan value types for archdisk
//!
//! Stringly-typed plan values (roles, filesystems, btrfs knobs) are parsed
//! into enums so the validator and executor can match exhaustively.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Intended role of a disk or partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Role {
    /// EFI System Partition
    Boot,
    Root,
    Workspace,
    Home,
    Swap,
    Cache,
    #[default]
    Data,
}

impl Role {
    /// Whether a missing mount for this role is only a degradation.
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::Cache | Self::Data)
    }
}

/// Filesystem type for partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FsType {
    /// FAT32, used for the EFI System Partition
    Vfat,
    Btrfs,
    Swap,
}

impl FsType {
    /// The `TYPE=` value blkid reports for this filesystem.
    pub fn blkid_type(&self) -> &'static str {
        match self {
            Self::Vfat => "vfat",
            Self::Btrfs => "btrfs",
            Self::Swap => "swap",
        }
    }

    /// Filesystem hint passed to `parted mkpart`.
    pub fn parted_hint(&self) -> &'static str {
        match self {
            Self::Vfat => "fat32",
            Self::Btrfs => "btrfs",
            Self::Swap => "linux-swap",
        }
    }

    /// Default fstab fsck pass number.
    ///
    /// btrfs has no boot-time fsck, so it is 0 like `genfstab` emits.
    pub fn default_pass(&self) -> u8 {
        match self {
            Self::Vfat => 2,
            Self::Btrfs | Self::Swap => 0,
        }
    }
}

/// Partition table type. Only GPT is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TableType {
    #[default]
    Gpt,
}

/// btrfs checksum algorithm (`mkfs.btrfs --csum`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ChecksumAlgo {
    #[default]
    Crc32c,
    Xxhash,
    Sha256,
    Blake2,
}

/// btrfs discard mode (`discard=` mount option)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DiscardMode {
    #[default]
    Async,
    Sync,
    /// Emit `nodiscard`
    Off,
}

/// btrfs compression algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CompressAlgo {
    #[default]
    Zstd,
    Lzo,
    Zlib,
}

impl CompressAlgo {
    /// Valid compression level range, if the algorithm takes one.
    pub fn level_range(&self) -> Option<(u8, u8)> {
        match self {
            Self::Zstd => Some((1, 15)),
            Self::Zlib => Some((1, 9)),
            Self::Lzo => None,
        }
    }
}

/// Outcome of a single verification check
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[strum(serialize = "PASS")]
    Pass,
    #[strum(serialize = "WARN")]
    Warn,
    #[strum(serialize = "FAIL")]
    Fail,
}
