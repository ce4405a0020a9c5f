//! Pre-flight checks for the live environment
//!
//! Before any plan is applied this verifies:
//! - Every tool the system backend shells out to is on `PATH`
//! - The process runs with root privileges (EUID 0)
//!
//! The checks only report; the CLI decides whether to stop.

use std::process::Command;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::interrupt::CommandProcessGroup;

/// Set to `1` or `true` to skip the root check during development
pub const SKIP_ROOT_ENV: &str = "ARCHDISK_SKIP_ROOT_CHECK";

/// Binaries the system backend runs, with the Arch package providing each
const REQUIRED_BINARIES: &[(&str, &str)] = &[
    ("wipefs", "util-linux"),
    ("parted", "parted"),
    ("partprobe", "parted"),
    ("udevadm", "systemd"),
    ("blkid", "util-linux"),
    ("blockdev", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("swapon", "util-linux"),
    ("mkfs.fat", "dosfstools"),
    ("mkfs.btrfs", "btrfs-progs"),
    ("btrfs", "btrfs-progs"),
    ("mkswap", "util-linux"),
    ("cryptsetup", "cryptsetup"),
    ("chattr", "e2fsprogs"),
];

/// Only needed for some filesystem types
const OPTIONAL_BINARIES: &[(&str, &str)] = &[
    ("mkfs.ext4", "e2fsprogs"),
    ("mkfs.xfs", "xfsprogs"),
];

/// Result of environment verification
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub missing_binaries: Vec<String>,
    pub missing_optional: Vec<String>,
    pub is_root: bool,
    pub root_check_skipped: bool,
}

impl PreflightReport {
    /// Returns true if all checks passed
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && (self.is_root || self.root_check_skipped)
    }

    /// Pacman packages that provide the missing binaries, deduplicated
    pub fn missing_packages(&self) -> Vec<&'static str> {
        let mut packages: Vec<&'static str> = self
            .missing_binaries
            .iter()
            .map(|b| package_for_binary(b))
            .collect();
        packages.sort_unstable();
        packages.dedup();
        packages
    }

    pub fn to_text(&self) -> String {
        let mut lines = Vec::new();
        if !self.is_root && !self.root_check_skipped {
            lines.push("ERROR: root privileges required".to_string());
            lines.push("   Partitioning and mounting need EUID 0; run with sudo or as root.".to_string());
        }
        if !self.missing_binaries.is_empty() {
            lines.push("ERROR: missing required binaries".to_string());
            for binary in &self.missing_binaries {
                lines.push(format!("   - {} (install: pacman -S {})", binary, package_for_binary(binary)));
            }
            lines.push(format!("   Solution: pacman -S {}", self.missing_packages().join(" ")));
        }
        for binary in &self.missing_optional {
            lines.push(format!(
                "note: {} not found; needed only for that filesystem type ({})",
                binary,
                package_for_binary(binary)
            ));
        }
        if self.is_ok() {
            lines.push("Pre-flight checks passed".to_string());
        }
        lines.join("\n")
    }
}

/// Check if a binary is available in PATH
fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .in_new_process_group()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Map binary names to their Arch Linux package names
fn package_for_binary(binary: &str) -> &'static str {
    REQUIRED_BINARIES
        .iter()
        .chain(OPTIONAL_BINARIES)
        .find(|(name, _)| *name == binary)
        .map(|(_, package)| *package)
        .unwrap_or("unknown")
}

/// `$ARCHDISK_SKIP_ROOT_CHECK` is `1` or `true`.
pub fn should_skip_root_check() -> bool {
    std::env::var(SKIP_ROOT_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Run all checks.
pub fn run_preflight(skip_root: bool) -> PreflightReport {
    debug!("running pre-flight checks (skip_root={})", skip_root);
    let check = |list: &[(&str, &str)]| -> Vec<String> {
        list.iter()
            .filter(|(name, _)| !binary_exists(name))
            .map(|(name, _)| (*name).to_string())
            .collect()
    };

    let skipped = skip_root || should_skip_root_check();
    if skipped {
        warn!("root check skipped ({}=1)", SKIP_ROOT_ENV);
    }

    let report = PreflightReport {
        missing_binaries: check(REQUIRED_BINARIES),
        missing_optional: check(OPTIONAL_BINARIES),
        is_root: is_running_as_root(),
        root_check_skipped: skipped,
    };
    if report.is_ok() {
        info!("pre-flight checks passed");
    } else {
        warn!("pre-flight checks failed: missing {:?}", report.missing_binaries);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_exists_sh() {
        assert!(binary_exists("sh"), "sh should be available");
    }

    #[test]
    fn test_binary_exists_nonexistent() {
        assert!(!binary_exists("this_binary_definitely_does_not_exist_12345"));
    }

    #[test]
    fn test_package_mapping() {
        assert_eq!(package_for_binary("mkfs.btrfs"), "btrfs-progs");
        assert_eq!(package_for_binary("cryptsetup"), "cryptsetup");
        assert_eq!(package_for_binary("mkfs.xfs"), "xfsprogs");
        assert_eq!(package_for_binary("frobnicate"), "unknown");
    }

    #[test]
    fn test_report_is_ok() {
        let ok = PreflightReport {
            missing_binaries: vec![],
            missing_optional: vec!["mkfs.xfs".to_string()],
            is_root: true,
            root_check_skipped: false,
        };
        assert!(ok.is_ok());

        let not_root_but_skipped = PreflightReport {
            is_root: false,
            root_check_skipped: true,
            ..ok.clone()
        };
        assert!(not_root_but_skipped.is_ok());

        let not_root = PreflightReport {
            is_root: false,
            ..ok.clone()
        };
        assert!(!not_root.is_ok());
        assert!(not_root.to_text().contains("root privileges required"));
    }

    #[test]
    fn test_missing_packages_deduplicated() {
        let report = PreflightReport {
            missing_binaries: vec!["mount".into(), "wipefs".into(), "parted".into()],
            missing_optional: vec![],
            is_root: true,
            root_check_skipped: false,
        };
        assert_eq!(report.missing_packages(), vec!["parted", "util-linux"]);
        assert!(report.to_text().contains("pacman -S parted util-linux"));
    }
}
