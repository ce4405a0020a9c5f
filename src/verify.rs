//! Read-only audit of live state.
//!
//! Against a plan, every expected element (device, partition, filesystem,
//! mapping, mount, subvolume, fstab and crypttab entry, helper script) yields
//! one [`Finding`]. Without a plan a generic layout checklist runs instead.
//! The verifier only ever receives a [`BlockProbe`], so it cannot mutate.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::device::{ActiveMount, BlockInfo, BlockProbe};
use crate::error::{ProvisionError, Result};
use crate::mount_table::{Crypttab, MountTable, crypttab_path, fstab_path};
use crate::plan::mounts::under_root;
use crate::plan::{MountPlanEntry, PartitionRef, Plan, mount_entries};
use crate::settings::Settings;
use crate::types::Status;

/// Present on UEFI-booted hosts.
const EFI_FIRMWARE_DIR: &str = "/sys/firmware/efi";

/// Sources that fstab legitimately keys by something other than a UUID.
const PSEUDO_SOURCES: &[&str] = &["tmpfs", "proc", "sysfs", "devpts", "none", "efivarfs"];

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Check name, e.g. `mount`, `fstab`
    pub check: String,
    /// What was checked, e.g. `/home` or `HOME`
    pub subject: String,
    pub status: Status,
    pub detail: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:<10} {}: {}", self.status, self.check, self.subject, self.detail)
    }
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub pass: usize,
    pub warn: usize,
    pub fail: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub root: PathBuf,
    pub findings: Vec<Finding>,
}

impl VerificationReport {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            findings: Vec::new(),
        }
    }

    fn push(&mut self, check: &str, subject: impl Into<String>, status: Status, detail: impl Into<String>) {
        self.findings.push(Finding {
            check: check.to_string(),
            subject: subject.into(),
            status,
            detail: detail.into(),
        });
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for finding in &self.findings {
            match finding.status {
                Status::Pass => summary.pass += 1,
                Status::Warn => summary.warn += 1,
                Status::Fail => summary.fail += 1,
            }
        }
        summary
    }

    /// `Fail` if any finding failed, else `Warn` if any warned, else `Pass`.
    pub fn overall(&self) -> Status {
        self.findings
            .iter()
            .map(|f| f.status)
            .max()
            .unwrap_or(Status::Pass)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.status == Status::Fail)
    }

    /// `VerificationFailed` when any finding failed; warnings pass.
    pub fn ensure_passed(&self) -> Result<()> {
        match self.failures().count() {
            0 => Ok(()),
            failed => Err(ProvisionError::VerificationFailed { failed }),
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for finding in &self.findings {
            out.push_str(&finding.to_string());
            out.push('\n');
        }
        let s = self.summary();
        out.push_str(&format!(
            "\n{}: {} pass, {} warn, {} fail\n",
            self.overall(),
            s.pass,
            s.warn,
            s.fail
        ));
        out
    }

    pub fn to_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Json<'a> {
            root: &'a Path,
            overall: Status,
            summary: Summary,
            findings: &'a [Finding],
        }
        Ok(serde_json::to_string_pretty(&Json {
            root: &self.root,
            overall: self.overall(),
            summary: self.summary(),
            findings: &self.findings,
        })?)
    }
}

/// Probe without failing on missing devices.
fn probe_quiet<P: BlockProbe + ?Sized>(probe: &P, device: &Path) -> Option<BlockInfo> {
    match probe.probe(device) {
        Ok(info) => info,
        Err(e) => {
            debug!("probe {} failed: {}", device.display(), e);
            None
        }
    }
}

fn uuid_of<P: BlockProbe + ?Sized>(probe: &P, device: &Path) -> Option<String> {
    probe_quiet(probe, device).and_then(|i| i.uuid)
}

/// `Fail`, or `Warn` when the element is optional.
fn missing(optional: bool) -> Status {
    if optional { Status::Warn } else { Status::Fail }
}

fn read_fstab<P: BlockProbe + ?Sized>(probe: &P, root: &Path) -> Result<Option<MountTable>> {
    Ok(probe.read_file(&fstab_path(root))?.map(|c| MountTable::parse(&c)))
}

// ============================================================================
// Plan verification
// ============================================================================

/// Verify live state against `plan`.
pub fn verify_plan<P: BlockProbe + ?Sized>(
    plan: &Plan,
    probe: &P,
    settings: &Settings,
    root: Option<&Path>,
) -> Result<VerificationReport> {
    let root = root
        .map(Path::to_path_buf)
        .unwrap_or_else(|| plan.target_root_or(&settings.target_root));
    let mut report = VerificationReport::new(&root);
    let mounts = probe.mounts()?;
    let swaps = probe.active_swaps()?;
    let entries = mount_entries(plan);

    for disk in &plan.disks {
        let subject = disk.device.display().to_string();
        if probe.is_block_device(&disk.device) {
            report.push("device", subject, Status::Pass, "present");
        } else {
            report.push("device", subject, missing(plan.disk_is_optional(disk)), "block device not found");
        }
    }

    for part in plan.partitions() {
        check_partition(&mut report, probe, plan, &part, &entries);
    }

    for entry in &entries {
        let Some(part) = plan.partition(&entry.partition) else {
            continue;
        };
        let optional = part.is_optional(plan) || entry.noauto;
        let device = part.fs_device();
        match &entry.mount_point {
            Some(mp) => check_mount(&mut report, probe, &mounts, &root, mp, entry, &device, optional),
            None => {
                if swaps.iter().any(|s| s == &device) {
                    report.push("swap", &entry.partition, Status::Pass, format!("{} active", device.display()));
                } else {
                    report.push("swap", &entry.partition, missing(optional), format!("{} not active", device.display()));
                }
            }
        }
    }

    for sub in &plan.subvolumes {
        check_subvolume(&mut report, probe, plan, &mounts, &sub.filesystem, &sub.name);
    }

    check_fstab_entries(&mut report, probe, plan, &root, &entries)?;
    check_crypttab(&mut report, probe, plan, &root)?;
    check_helpers(&mut report, probe, settings, &root);

    Ok(report)
}

fn check_partition<P: BlockProbe + ?Sized>(
    report: &mut VerificationReport,
    probe: &P,
    plan: &Plan,
    part: &PartitionRef<'_>,
    entries: &[MountPlanEntry],
) {
    let label = &part.spec.label;
    let optional = part.is_optional(plan);
    let node = part.node();

    if !probe.is_block_device(&node) {
        report.push("partition", label, missing(optional), format!("{} not found", node.display()));
        return;
    }
    report.push("partition", label, Status::Pass, format!("{} present", node.display()));

    if let Some(mapper) = part.mapper_name() {
        let container = probe_quiet(probe, &node);
        if container.as_ref().is_some_and(BlockInfo::is_luks) {
            report.push("luks", label, Status::Pass, format!("{} carries a LUKS header", node.display()));
        } else {
            report.push("luks", label, Status::Fail, format!("{} has no LUKS header", node.display()));
            return;
        }

        let mapped = part.fs_device();
        let open = probe.is_block_device(&mapped);
        let used = entries.iter().any(|e| &e.partition == label)
            || plan.subvolumes_of(label).next().is_some();
        match (open, used) {
            (true, _) => report.push("mapping", label, Status::Pass, format!("{} open", mapper)),
            (false, true) => {
                report.push("mapping", label, missing(optional), format!("{} is not open", mapper));
                return;
            }
            (false, false) => {
                report.push("mapping", label, Status::Warn, format!("{} is not open; filesystem not inspected", mapper));
                return;
            }
        }
    }

    let device = part.fs_device();
    let expected = part.spec.fs.blkid_type();
    match probe_quiet(probe, &device).and_then(|i| i.fs_type) {
        Some(found) if found == expected => {
            report.push("filesystem", label, Status::Pass, format!("{} on {}", found, device.display()))
        }
        Some(found) => report.push(
            "filesystem",
            label,
            Status::Fail,
            format!("expected {}, found {} on {}", expected, found, device.display()),
        ),
        None => report.push(
            "filesystem",
            label,
            missing(optional),
            format!("no filesystem on {}", device.display()),
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn check_mount<P: BlockProbe + ?Sized>(
    report: &mut VerificationReport,
    probe: &P,
    mounts: &[ActiveMount],
    root: &Path,
    mount_point: &Path,
    entry: &MountPlanEntry,
    device: &Path,
    optional: bool,
) {
    let subject = mount_point.display().to_string();
    let target = under_root(root, mount_point);
    let Some(active) = mounts.iter().rev().find(|m| m.target == target) else {
        report.push("mount", subject, missing(optional), format!("{} is not mounted", target.display()));
        return;
    };

    let expected_fs = entry.fs.blkid_type();
    if active.fs_type != expected_fs {
        report.push(
            "mount",
            subject,
            Status::Fail,
            format!("{} mounted as {}, expected {}", target.display(), active.fs_type, expected_fs),
        );
        return;
    }

    let same_source = active.source == device
        || matches!(
            (uuid_of(probe, &active.source), uuid_of(probe, device)),
            (Some(a), Some(b)) if a == b
        );
    if !same_source {
        report.push(
            "mount",
            subject,
            Status::Fail,
            format!("{} is backed by {}, expected {}", target.display(), active.source.display(), device.display()),
        );
        return;
    }

    if let Some(sub) = &entry.subvolume {
        let mounted = active.subvolume().unwrap_or_default();
        if mounted != sub.trim_start_matches('/') {
            report.push(
                "mount",
                subject,
                Status::Fail,
                format!("{} has subvolume '{}' mounted, expected '{}'", target.display(), mounted, sub),
            );
            return;
        }
    }

    report.push(
        "mount",
        subject,
        Status::Pass,
        format!("{} from {} ({})", target.display(), active.source.display(), active.fs_type),
    );
}

fn check_subvolume<P: BlockProbe + ?Sized>(
    report: &mut VerificationReport,
    probe: &P,
    plan: &Plan,
    mounts: &[ActiveMount],
    filesystem: &str,
    name: &str,
) {
    let subject = format!("{}:{}", filesystem, name);
    let Some(part) = plan.partition(filesystem) else {
        report.push("subvolume", subject, Status::Fail, format!("filesystem {} is not in the plan", filesystem));
        return;
    };
    let optional = part.is_optional(plan);
    let device = part.fs_device();
    let uuid = uuid_of(probe, &device);

    let mount = mounts.iter().find(|m| {
        m.fs_type == "btrfs"
            && (m.source == device || (uuid.is_some() && uuid_of(probe, &m.source) == uuid))
    });
    let Some(mount) = mount else {
        report.push("subvolume", subject, Status::Warn, format!("{} is not mounted; cannot list subvolumes", filesystem));
        return;
    };

    match probe.list_subvolumes(&mount.target) {
        Ok(list) if list.iter().any(|s| s.trim_start_matches('/') == name) => {
            report.push("subvolume", subject, Status::Pass, "present")
        }
        Ok(_) => report.push("subvolume", subject, missing(optional), "not found"),
        Err(e) => report.push("subvolume", subject, Status::Warn, format!("cannot list subvolumes: {}", e)),
    }
}

fn check_fstab_entries<P: BlockProbe + ?Sized>(
    report: &mut VerificationReport,
    probe: &P,
    plan: &Plan,
    root: &Path,
    entries: &[MountPlanEntry],
) -> Result<()> {
    let path = fstab_path(root);
    let Some(table) = read_fstab(probe, root)? else {
        report.push("fstab", path.display().to_string(), Status::Fail, "missing");
        return Ok(());
    };

    for entry in entries {
        let Some(part) = plan.partition(&entry.partition) else {
            continue;
        };
        let uuid = uuid_of(probe, &part.fs_device());
        let (subject, found) = match &entry.mount_point {
            Some(mp) => {
                let mp = mp.display().to_string();
                let found = table.find(&mp);
                (mp, found)
            }
            None => {
                let found = table
                    .entries()
                    .find(|e| e.is_swap() && uuid.is_some() && e.uuid() == uuid.as_deref());
                (format!("swap {}", entry.partition), found)
            }
        };

        let Some(found) = found else {
            report.push("fstab", subject, missing(part.is_optional(plan)), "no entry");
            continue;
        };
        if !found.is_uuid_keyed() {
            report.push("fstab", subject, Status::Fail, format!("keyed by {}, not UUID", found.source));
        } else if uuid.is_some() && found.uuid() != uuid.as_deref() {
            report.push(
                "fstab",
                subject,
                Status::Fail,
                format!("{} does not match filesystem UUID {}", found.source, uuid.unwrap_or_default()),
            );
        } else if found.fs_type != entry.fs.blkid_type() {
            report.push(
                "fstab",
                subject,
                Status::Fail,
                format!("type {}, expected {}", found.fs_type, entry.fs.blkid_type()),
            );
        } else {
            report.push("fstab", subject, Status::Pass, found.source.clone());
        }
    }
    Ok(())
}

fn check_crypttab<P: BlockProbe + ?Sized>(
    report: &mut VerificationReport,
    probe: &P,
    plan: &Plan,
    root: &Path,
) -> Result<()> {
    if !plan.needs_passphrase() {
        return Ok(());
    }
    let tab = probe
        .read_file(&crypttab_path(root))?
        .map(|c| Crypttab::parse(&c))
        .unwrap_or_default();

    for part in plan.partitions() {
        let Some(mapper) = part.mapper_name() else {
            continue;
        };
        let luks_uuid = uuid_of(probe, &part.node());
        match tab.find(&mapper) {
            Some(entry) if luks_uuid.is_none() || entry.uuid() == luks_uuid.as_deref() => {
                report.push("crypttab", &mapper, Status::Pass, entry.device.clone())
            }
            Some(entry) => report.push(
                "crypttab",
                &mapper,
                Status::Warn,
                format!("{} does not match LUKS UUID of {}", entry.device, part.node().display()),
            ),
            None => report.push("crypttab", &mapper, Status::Warn, "no entry; volume will not unlock at boot"),
        }
    }
    Ok(())
}

fn check_helpers<P: BlockProbe + ?Sized>(
    report: &mut VerificationReport,
    probe: &P,
    settings: &Settings,
    root: &Path,
) {
    for script in &settings.helper_scripts {
        let path = under_root(root, script);
        let subject = script.display().to_string();
        if probe.path_exists(&path) {
            report.push("helper", subject, Status::Pass, "present");
        } else {
            report.push("helper", subject, Status::Warn, format!("{} not found", path.display()));
        }
    }
}

// ============================================================================
// Generic checklist
// ============================================================================

/// Sane-layout checklist for a system without a plan.
pub fn verify_system<P: BlockProbe + ?Sized>(
    probe: &P,
    settings: &Settings,
    root: Option<&Path>,
) -> Result<VerificationReport> {
    let root = root
        .map(Path::to_path_buf)
        .unwrap_or_else(|| settings.target_root.clone());
    let mut report = VerificationReport::new(&root);
    let mounts = probe.mounts()?;
    let mounted_at = |mp: &str| {
        let target = under_root(&root, Path::new(mp));
        mounts.iter().rev().find(|m| m.target == target).cloned()
    };

    match mounted_at("/") {
        Some(m) => report.push("mount", "/", Status::Pass, format!("{} ({})", m.source.display(), m.fs_type)),
        None => report.push("mount", "/", Status::Fail, format!("nothing mounted at {}", root.display())),
    }

    if probe.path_exists(Path::new(EFI_FIRMWARE_DIR)) {
        let esp = ["/boot", "/efi", "/boot/efi"]
            .iter()
            .find_map(|mp| mounted_at(mp).filter(|m| m.fs_type == "vfat").map(|m| (*mp, m)));
        match esp {
            Some((mp, m)) => report.push("esp", mp, Status::Pass, format!("{} (vfat)", m.source.display())),
            None => report.push("esp", "/boot", Status::Fail, "UEFI host but no vfat ESP mounted"),
        }
    } else {
        report.push("esp", "/boot", Status::Pass, "legacy BIOS host; no ESP required");
    }

    let path = fstab_path(&root);
    match read_fstab(probe, &root)? {
        None => report.push("fstab", path.display().to_string(), Status::Fail, "missing"),
        Some(table) if table.is_empty() => {
            report.push("fstab", path.display().to_string(), Status::Fail, "no entries")
        }
        Some(table) => {
            let device_keyed: Vec<String> = table
                .entries()
                .filter(|e| !e.is_uuid_keyed() && !PSEUDO_SOURCES.contains(&e.source.as_str()))
                .map(|e| format!("{} ({})", e.mount_point, e.source))
                .collect();
            if device_keyed.is_empty() {
                report.push("fstab", path.display().to_string(), Status::Pass, format!("{} UUID-keyed entries", table.len()));
            } else {
                report.push(
                    "fstab",
                    path.display().to_string(),
                    Status::Fail,
                    format!("not UUID-keyed: {}", device_keyed.join(", ")),
                );
            }
            for line in table.malformed_lines() {
                report.push("fstab", path.display().to_string(), Status::Warn, format!("unparseable line: {}", line));
            }
        }
    }

    let swaps = probe.active_swaps()?;
    if swaps.is_empty() {
        report.push("swap", "swap", Status::Warn, "no active swap");
    } else {
        let list: Vec<String> = swaps.iter().map(|s| s.display().to_string()).collect();
        report.push("swap", "swap", Status::Pass, list.join(", "));
    }

    match mounted_at("/home") {
        Some(m) => report.push("mount", "/home", Status::Pass, format!("{} ({})", m.source.display(), m.fs_type)),
        None => report.push("mount", "/home", Status::Warn, "/home is not a separate mount"),
    }

    let cache = settings.cache_mount.display().to_string();
    match mounted_at(&cache) {
        Some(m) => report.push("mount", cache, Status::Pass, format!("{} ({})", m.source.display(), m.fs_type)),
        None => report.push("mount", cache, Status::Warn, "cache volume is not mounted"),
    }

    check_helpers(&mut report, probe, settings, &root);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevices;

    fn settings() -> Settings {
        Settings {
            helper_scripts: vec![],
            ..Settings::default()
        }
    }

    #[test]
    fn test_overall_is_worst_status() {
        let mut report = VerificationReport::new(Path::new("/mnt"));
        assert_eq!(report.overall(), Status::Pass);
        report.push("a", "x", Status::Pass, "");
        report.push("b", "y", Status::Warn, "");
        assert_eq!(report.overall(), Status::Warn);
        report.push("c", "z", Status::Fail, "");
        assert_eq!(report.overall(), Status::Fail);
        assert_eq!(report.summary(), Summary { pass: 1, warn: 1, fail: 1 });
    }

    #[test]
    fn test_text_and_json_output() {
        let mut report = VerificationReport::new(Path::new("/mnt"));
        report.push("mount", "/", Status::Fail, "nothing mounted");
        let text = report.to_text();
        assert!(text.contains("[FAIL] mount"));
        assert!(text.ends_with("FAIL: 0 pass, 0 warn, 1 fail\n"));

        let json: serde_json::Value =
            serde_json::from_str(&report.to_json().expect("json")).expect("valid json");
        assert_eq!(json["overall"], "fail");
        assert_eq!(json["summary"]["fail"], 1);
        assert_eq!(json["findings"][0]["check"], "mount");
    }

    #[test]
    fn test_generic_checklist_on_empty_host() {
        let devices = FakeDevices::new();
        let report = verify_system(&devices, &settings(), None).expect("verify");
        assert_eq!(report.overall(), Status::Fail);
        let failed: Vec<&str> = report.failures().map(|f| f.check.as_str()).collect();
        assert_eq!(failed, vec!["mount", "fstab"]);
    }

    #[test]
    fn test_generic_checklist_flags_device_keyed_fstab() {
        let devices = FakeDevices::new().with_file(
            "/mnt/etc/fstab",
            "/dev/sda2 / btrfs defaults 0 0\ntmpfs /tmp tmpfs defaults 0 0\n",
        );
        let report = verify_system(&devices, &settings(), None).expect("verify");
        let fstab = report
            .findings
            .iter()
            .find(|f| f.check == "fstab")
            .expect("fstab finding");
        assert_eq!(fstab.status, Status::Fail);
        assert!(fstab.detail.contains("/ (/dev/sda2)"));
        assert!(!fstab.detail.contains("tmpfs"));
    }

    #[test]
    fn test_plan_verify_without_devices_fails_but_does_not_error() {
        let plan = Plan::from_toml_str(
            r#"
[[disk]]
device = "/dev/sda"

[[disk.partition]]
label = "ROOT"
role = "root"
filesystem = "btrfs"
size = "remainder"
mount_point = "/"
"#,
        )
        .expect("plan parses"); // test: known-good input
        let devices = FakeDevices::new();
        let report = verify_plan(&plan, &devices, &settings(), None).expect("verify");
        assert_eq!(report.overall(), Status::Fail);
        assert!(report.findings.iter().any(|f| f.check == "device" && f.status == Status::Fail));

        let err = report.ensure_passed().expect_err("failed findings");
        assert!(matches!(err, ProvisionError::VerificationFailed { failed } if failed > 0));
        assert_eq!(err.exit_code(), crate::error::EXIT_VERIFICATION);
    }

    #[test]
    fn test_warnings_still_pass() {
        let mut report = VerificationReport::new(Path::new("/mnt"));
        report.push("helper", "/usr/local/bin/x", Status::Warn, "missing");
        assert!(report.ensure_passed().is_ok());
    }
}
