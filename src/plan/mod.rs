//! Declarative provisioning plan.
//!
//! A plan describes target disks, their partitions, btrfs subvolumes and where
//! everything mounts. It is an immutable input: nothing in this module touches
//! a device. Plans are TOML documents by default; files ending in `.json` are
//! read as JSON.
//!
//! ```toml
//! [[disk]]
//! device = "/dev/nvme0n1"
//! role = "root"
//!
//! [[disk.partition]]
//! label = "ESP"
//! role = "boot"
//! filesystem = "vfat"
//! size = "1GiB"
//! mount_point = "/boot"
//!
//! [[disk.partition]]
//! label = "ROOT"
//! role = "root"
//! filesystem = "btrfs"
//! size = "remainder"
//! mount_point = "/"
//!
//! [[subvolume]]
//! filesystem = "ROOT"
//! name = "@log"
//! mount_point = "/var/log"
//! ```

pub mod mounts;
pub mod options;
pub mod size;
pub mod validate;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::commands::encryption::{LuksCipher, LuksHash, Pbkdf};
use crate::device::{mapper_path, partition_path};
use crate::error::{ProvisionError, Result};
use crate::types::{ChecksumAlgo, FsType, Role, TableType};

pub use mounts::{MountPlanEntry, mount_entries, ordered_mount_entries};
pub use options::{Compression, MountOptions};
pub use size::Size;
pub use validate::validate;

/// Mount points a bootable system cannot do without, whatever role they carry.
pub const SYSTEM_MOUNT_POINTS: &[&str] = &["/", "/boot", "/efi", "/usr", "/var"];

fn is_system_mount_point(mount_point: &Option<PathBuf>) -> bool {
    mount_point
        .as_deref()
        .is_some_and(|mp| SYSTEM_MOUNT_POINTS.iter().any(|s| mp == Path::new(s)))
}

/// The whole provisioning plan
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    /// Where the installed system is assembled (defaults to the settings value)
    #[serde(default)]
    pub target_root: Option<PathBuf>,

    #[serde(default, rename = "disk", alias = "disks")]
    pub disks: Vec<DiskSpec>,

    #[serde(default, rename = "subvolume", alias = "subvolumes")]
    pub subvolumes: Vec<SubvolumeSpec>,
}

/// One target disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskSpec {
    pub device: PathBuf,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub table: TableType,
    #[serde(default, rename = "partition", alias = "partitions")]
    pub partitions: Vec<PartitionSpec>,
}

/// One partition, in on-disk order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionSpec {
    /// GPT partition name; also the filesystem label
    pub label: String,
    #[serde(default)]
    pub role: Role,
    #[serde(rename = "filesystem", alias = "fs")]
    pub fs: FsType,
    pub size: Size,
    /// Explicit start offset; defaults to the end of the previous partition
    #[serde(default)]
    pub start: Option<Size>,
    #[serde(default)]
    pub encryption: Option<EncryptionSpec>,
    #[serde(default)]
    pub btrfs: Option<BtrfsFeatures>,
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    #[serde(default)]
    pub mount_options: MountOptions,
    #[serde(default)]
    pub dump: Option<u8>,
    #[serde(default)]
    pub pass: Option<u8>,
}

/// LUKS2 parameters for an encrypted partition. Never holds the passphrase.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncryptionSpec {
    pub cipher: LuksCipher,
    /// Key size in bits; defaults to the cipher's XTS key size
    pub key_size: Option<u32>,
    pub hash: LuksHash,
    pub pbkdf: Pbkdf,
    /// `/dev/mapper/<name>`; defaults to `crypt` + lowercase label
    pub mapped_name: Option<String>,
}

impl EncryptionSpec {
    pub fn key_size(&self) -> u32 {
        self.key_size.unwrap_or_else(|| self.cipher.key_size())
    }
}

/// btrfs `mkfs` features
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BtrfsFeatures {
    pub checksum: ChecksumAlgo,
    pub node_size: Option<Size>,
}

/// A btrfs subvolume on one of the plan's btrfs partitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubvolumeSpec {
    /// Label of the parent btrfs partition
    pub filesystem: String,
    /// Subvolume path relative to the top level, e.g. `@home`
    pub name: String,
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    #[serde(default)]
    pub mount_options: MountOptions,
}

/// A partition together with where it lives.
#[derive(Debug, Clone, Copy)]
pub struct PartitionRef<'a> {
    pub disk: &'a DiskSpec,
    pub spec: &'a PartitionSpec,
    /// 1-based partition number
    pub number: u32,
}

impl PartitionRef<'_> {
    /// Raw partition node, e.g. `/dev/nvme0n1p2`.
    pub fn node(&self) -> PathBuf {
        partition_path(&self.disk.device, self.number)
    }

    /// Mapper name when encrypted.
    pub fn mapper_name(&self) -> Option<String> {
        self.spec.mapper_name()
    }

    /// Device carrying the filesystem: the mapping when encrypted, else the node.
    pub fn fs_device(&self) -> PathBuf {
        match self.mapper_name() {
            Some(name) => mapper_path(&name),
            None => self.node(),
        }
    }

    pub fn is_esp(&self) -> bool {
        self.spec.role == Role::Boot
    }

    /// Whether a missing piece of this partition only degrades the install.
    ///
    /// A partition that is the ESP, has a required role, or carries a system
    /// mount point (directly or through one of its subvolumes) is required.
    pub fn is_optional(&self, plan: &Plan) -> bool {
        if self.is_esp() || !self.spec.role.is_optional() {
            return false;
        }
        !(is_system_mount_point(&self.spec.mount_point)
            || plan
                .subvolumes_of(&self.spec.label)
                .any(|s| is_system_mount_point(&s.mount_point)))
    }
}

impl PartitionSpec {
    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn mapper_name(&self) -> Option<String> {
        self.encryption.as_ref().map(|enc| {
            enc.mapped_name
                .clone()
                .unwrap_or_else(|| format!("crypt{}", self.label.to_lowercase()))
        })
    }
}

impl Plan {
    /// Load a plan from a TOML or JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ProvisionError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read plan {}: {}", path.display(), e),
            ))
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Render the plan back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ProvisionError::config(e.to_string()))
    }

    /// Every partition in declaration order.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionRef<'_>> {
        self.disks.iter().flat_map(|disk| {
            disk.partitions
                .iter()
                .enumerate()
                .map(move |(i, spec)| PartitionRef {
                    disk,
                    spec,
                    number: i as u32 + 1,
                })
        })
    }

    /// Look up a partition by label.
    pub fn partition(&self, label: &str) -> Option<PartitionRef<'_>> {
        self.partitions().find(|p| p.spec.label == label)
    }

    /// A disk is optional only when its role is and every partition on it is.
    pub fn disk_is_optional(&self, disk: &DiskSpec) -> bool {
        disk.role.is_optional()
            && self
                .partitions()
                .filter(|p| p.disk.device == disk.device)
                .all(|p| p.is_optional(self))
    }

    pub fn needs_passphrase(&self) -> bool {
        self.partitions().any(|p| p.spec.is_encrypted())
    }

    /// Subvolumes declared on the given partition label.
    pub fn subvolumes_of<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a SubvolumeSpec> {
        self.subvolumes.iter().filter(move |s| s.filesystem == label)
    }

    /// Target root, falling back to the given default.
    pub fn target_root_or(&self, default: &Path) -> PathBuf {
        self.target_root
            .clone()
            .unwrap_or_else(|| default.to_path_buf())
    }

    /// Mount point of the first partition or subvolume with the given role.
    pub fn mount_point_for_role(&self, role: Role) -> Option<PathBuf> {
        self.partitions()
            .filter(|p| p.spec.role == role)
            .find_map(|p| {
                p.spec.mount_point.clone().or_else(|| {
                    self.subvolumes_of(&p.spec.label)
                        .find_map(|s| s.mount_point.clone())
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
target_root = "/mnt"

[[disk]]
device = "/dev/nvme0n1"
role = "root"

[[disk.partition]]
label = "ESP"
role = "boot"
filesystem = "vfat"
size = "1GiB"
mount_point = "/boot"

[[disk.partition]]
label = "ROOT"
role = "root"
filesystem = "btrfs"
size = "remainder"
mount_point = "/"
btrfs = { checksum = "xxhash", node_size = "16KiB" }
mount_options = { compress = "zstd:1", noatime = true }

[[disk]]
device = "/dev/sda"
role = "home"

[[disk.partition]]
label = "HOME"
role = "home"
filesystem = "btrfs"
size = "remainder"
encryption = {}

[[subvolume]]
filesystem = "HOME"
name = "@home"
mount_point = "/home"
mount_options = { discard = "async" }
"#;

    #[test]
    fn test_parse_toml_plan() {
        let plan = Plan::from_toml_str(SAMPLE).expect("sample plan parses"); // test: known-good input
        assert_eq!(plan.disks.len(), 2);
        assert_eq!(plan.disks[0].partitions.len(), 2);
        assert_eq!(plan.subvolumes.len(), 1);

        let root = plan.partition("ROOT").expect("ROOT declared");
        assert_eq!(root.number, 2);
        assert_eq!(root.node(), PathBuf::from("/dev/nvme0n1p2"));
        assert_eq!(
            root.spec.btrfs.as_ref().map(|b| b.checksum),
            Some(ChecksumAlgo::Xxhash)
        );
    }

    #[test]
    fn test_encryption_defaults() {
        let plan = Plan::from_toml_str(SAMPLE).expect("sample plan parses");
        let home = plan.partition("HOME").expect("HOME declared");
        let enc = home.spec.encryption.as_ref().expect("HOME encrypted");
        assert_eq!(enc.cipher, LuksCipher::Aes256Xts);
        assert_eq!(enc.key_size(), 512);
        assert_eq!(enc.hash, LuksHash::Sha256);
        assert_eq!(home.mapper_name(), Some("crypthome".to_string()));
        assert_eq!(home.fs_device(), PathBuf::from("/dev/mapper/crypthome"));
        assert!(plan.needs_passphrase());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let bad = r#"
[[disk]]
device = "/dev/sda"
passphrase = "hunter2"
"#;
        assert!(Plan::from_toml_str(bad).is_err());
    }

    #[test]
    fn test_json_plan() {
        let json = r#"{
            "disks": [{
                "device": "/dev/vdb",
                "partitions": [
                    {"label": "SWAP", "role": "swap", "filesystem": "swap", "size": "8GiB"}
                ]
            }]
        }"#;
        let plan = Plan::from_json_str(json).expect("json plan parses");
        assert_eq!(plan.partitions().count(), 1);
        assert!(!plan.needs_passphrase());
    }

    #[test]
    fn test_mount_point_for_role() {
        let plan = Plan::from_toml_str(SAMPLE).expect("sample plan parses");
        assert_eq!(
            plan.mount_point_for_role(Role::Home),
            Some(PathBuf::from("/home"))
        );
        assert_eq!(plan.mount_point_for_role(Role::Cache), None);
    }

    #[test]
    fn test_required_follows_mount_points_not_default_role() {
        let plan = Plan::from_toml_str(
            r#"
[[disk]]
device = "/dev/sda"

[[disk.partition]]
label = "SYS"
filesystem = "btrfs"
size = "64GiB"

[[disk.partition]]
label = "SCRATCH"
filesystem = "btrfs"
size = "remainder"
mount_point = "/srv"

[[disk]]
device = "/dev/sdb"

[[disk.partition]]
label = "BULK"
filesystem = "btrfs"
size = "remainder"
mount_point = "/data"

[[subvolume]]
filesystem = "SYS"
name = "@"
mount_point = "/"
"#,
        )
        .expect("plan parses"); // test: known-good input

        let sys = plan.partition("SYS").expect("SYS declared");
        let scratch = plan.partition("SCRATCH").expect("SCRATCH declared");
        assert!(!sys.is_optional(&plan));
        assert!(scratch.is_optional(&plan));
        assert!(!plan.disk_is_optional(&plan.disks[0]));
        assert!(plan.disk_is_optional(&plan.disks[1]));
    }

    #[test]
    fn test_esp_and_root_role_always_required() {
        let plan = Plan::from_toml_str(SAMPLE).expect("sample plan parses");
        for label in ["ESP", "ROOT", "HOME"] {
            let part = plan.partition(label).expect("declared");
            assert!(!part.is_optional(&plan), "{} should be required", label);
        }
    }

    #[test]
    fn test_toml_round_trip_preserves_plan() {
        let plan = Plan::from_toml_str(SAMPLE).expect("sample plan parses");
        let rendered = plan.to_toml_string().expect("plan renders");
        let reparsed = Plan::from_toml_str(&rendered).expect("rendered plan parses");
        assert_eq!(plan, reparsed);
    }
}
