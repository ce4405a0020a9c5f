//! Plan executor.
//!
//! Applies a compiled [`StoragePlan`] to real (or simulated) devices through
//! [`DeviceOps`]. Everything that can refuse the run happens before the first
//! mutation: validation, the confirmation token, the passphrase, busy devices
//! and pre-existing LUKS headers.
//!
//! Failure policy: any failure aborts the current stage and leaves applied
//! steps in place. The mount stage is the exception within the stage: it keeps
//! mounting entries that do not depend on a failed one, then reports every
//! failed or skipped entry at once.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::commands::encryption::{KeyMaterial, SecretFile};
use crate::device::{BlockInfo, BlockProbe, DeviceOps, device_busy_reason};
use crate::engine::storage::{CryptVolume, MountSource, PlannedOp, StorageOp, StoragePlan, compile};
use crate::error::{FailedMount, ProvisionError, Result};
use crate::interrupt::InterruptFlag;
use crate::mount_table::{Crypttab, CrypttabEntry, FstabEntry, MountTable};
use crate::plan::{Plan, validate};
use crate::provision_state::{ProvisionContext, ProvisionStage};
use crate::settings::Settings;

/// Stages that run storage operations, in order.
const EXECUTION_STAGES: [ProvisionStage; 7] = [
    ProvisionStage::Wiping,
    ProvisionStage::Partitioning,
    ProvisionStage::WaitingForPartitions,
    ProvisionStage::Formatting,
    ProvisionStage::CreatingSubvolumes,
    ProvisionStage::Mounting,
    ProvisionStage::WritingMountTable,
];

/// Proof that the operator explicitly asked for destruction.
///
/// Only [`ConfirmationToken::confirm`] creates one, and it logs doing so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationToken {
    _private: (),
}

impl ConfirmationToken {
    pub fn confirm(source: &str) -> Self {
        info!("destructive operations confirmed via {}", source);
        Self { _private: () }
    }
}

/// Inputs to one apply run besides the plan.
#[derive(Debug, Default)]
pub struct ApplyOptions {
    pub confirmation: Option<ConfirmationToken>,
    /// Overwrite existing LUKS volumes on target disks
    pub force: bool,
    /// Operator-supplied keyfile; takes precedence over `passphrase`
    pub key_file: Option<PathBuf>,
    /// Passphrase read from the environment, staged into a wiped keyfile
    pub passphrase: Option<String>,
    pub interrupt: Option<InterruptFlag>,
}

/// What an apply run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub target_root: PathBuf,
    pub partitions_created: usize,
    pub luks_formatted: usize,
    pub filesystems_created: usize,
    pub mappings_opened: usize,
    pub mappings_closed: usize,
    /// Mappings left open for the mounted system
    pub active_mappings: Vec<String>,
    pub subvolumes_created: usize,
    pub mounted: Vec<PathBuf>,
    pub swaps_activated: Vec<PathBuf>,
    /// Final fstab entries, parents before children
    pub mount_table: Vec<FstabEntry>,
    pub crypttab: Vec<CrypttabEntry>,
    pub stages: Vec<ProvisionStage>,
}

impl ApplyReport {
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Provisioned {}", self.target_root.display()),
            format!("  Partitions created:  {}", self.partitions_created),
            format!("  LUKS volumes:        {}", self.luks_formatted),
            format!("  Filesystems created: {}", self.filesystems_created),
            format!(
                "  Mappings opened/closed: {}/{} (active: {})",
                self.mappings_opened,
                self.mappings_closed,
                if self.active_mappings.is_empty() {
                    "none".to_string()
                } else {
                    self.active_mappings.join(", ")
                }
            ),
            format!("  Subvolumes created:  {}", self.subvolumes_created),
            format!("  Mounted:             {}", self.mounted.len()),
            format!("  Swap activated:      {}", self.swaps_activated.len()),
            "  Mount table:".to_string(),
        ];
        for entry in &self.mount_table {
            lines.push(format!("    {}", entry));
        }
        lines.join("\n")
    }
}

/// Validate, compile and apply `plan`.
///
/// # Errors
///
/// - `InvalidPlan` before anything else
/// - `DestructiveOperationRefused` without a confirmation token, or when a
///   target carries a LUKS header and `force` is off
/// - `MissingPassphrase` when encrypted partitions have no key source
/// - `DeviceBusy` when a target is mounted, swapped on or held
/// - any step failure wrapped in `Step`; `MountFailure` for the mount stage
pub fn apply<D: DeviceOps + ?Sized>(
    plan: &Plan,
    devices: &mut D,
    settings: &Settings,
    options: &ApplyOptions,
) -> Result<ApplyReport> {
    let target_root = plan.target_root_or(&settings.target_root);
    let mut executor = Executor {
        devices,
        settings,
        interrupt: options.interrupt.as_ref(),
        key: None,
        ctx: ProvisionContext::new(),
        report: ApplyReport {
            target_root: target_root.clone(),
            ..ApplyReport::default()
        },
        last_step: "start".to_string(),
    };

    let result = executor.run(plan, &target_root, options);
    if let Err(e) = &result {
        let stage = executor.ctx.current_stage();
        if executor.ctx.fail().is_ok() {
            warn!("provisioning failed during '{}': {}", stage, e);
        }
    }
    result.map(|()| {
        executor.report.stages = executor.ctx.stage_history().iter().map(|(s, _)| *s).collect();
        executor.report
    })
}

/// Compile without touching devices, for `plan show`.
pub fn dry_run<P: BlockProbe + ?Sized>(plan: &Plan, probe: &P, settings: &Settings) -> Result<StoragePlan> {
    validate(plan, probe)?;
    compile(
        plan,
        &plan.target_root_or(&settings.target_root),
        &settings.scratch_dir,
    )
}

struct Executor<'a, D: ?Sized> {
    devices: &'a mut D,
    settings: &'a Settings,
    interrupt: Option<&'a InterruptFlag>,
    key: Option<KeyMaterial>,
    ctx: ProvisionContext,
    report: ApplyReport,
    last_step: String,
}

impl<D: DeviceOps + ?Sized> Executor<'_, D> {
    fn run(&mut self, plan: &Plan, target_root: &Path, options: &ApplyOptions) -> Result<()> {
        self.ctx.advance()?;
        validate(plan, &*self.devices)?;
        let storage = compile(plan, target_root, &self.settings.scratch_dir)?;
        debug!("compiled {} storage operations", storage.ops.len());

        if storage.is_destructive() && options.confirmation.is_none() {
            let disks: Vec<String> = storage.disks.iter().map(|d| d.display().to_string()).collect();
            return Err(ProvisionError::refused(format!(
                "plan erases {}; no confirmation given",
                disks.join(", ")
            )));
        }
        self.key = resolve_key(plan, self.settings, options)?;

        self.ctx.advance()?;
        check_devices(&*self.devices, plan, options.force)?;

        self.ctx.confirm_destructive_operations();
        info!(
            "applying {} operations to {}",
            storage.ops.len(),
            storage
                .disks
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        for stage in EXECUTION_STAGES {
            self.ctx.transition_to(stage)?;
            info!("stage: {}", stage);
            if stage == ProvisionStage::Mounting {
                self.run_mount_stage(&storage)?;
                continue;
            }
            for (_, planned) in storage.ops_in(stage) {
                self.check_interrupt()?;
                self.run_op(planned)
                    .map_err(|e| e.in_step(format!("{}: {}", planned.stage, planned.op)))?;
                self.last_step = planned.op.to_string();
            }
        }

        self.ctx.advance()?;
        info!("provisioning complete: {}", target_root.display());
        Ok(())
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.is_some_and(InterruptFlag::is_raised) {
            warn!("interrupt honored after '{}'", self.last_step);
            return Err(ProvisionError::Interrupted {
                after_step: self.last_step.clone(),
            });
        }
        Ok(())
    }

    fn key_path(&self) -> Result<&Path> {
        self.key
            .as_ref()
            .map(KeyMaterial::path)
            .ok_or_else(|| ProvisionError::MissingPassphrase {
                env_var: self.settings.passphrase_env.clone(),
            })
    }

    fn run_op(&mut self, planned: &PlannedOp) -> Result<()> {
        match &planned.op {
            StorageOp::WipeSignatures { device } => self.devices.wipe_signatures(device)?,
            StorageOp::CreatePartitionTable { disk, table } => {
                self.devices.create_partition_table(disk, *table)?
            }
            StorageOp::CreatePartition { disk, partition, .. } => {
                self.devices.create_partition(disk, partition)?;
                self.report.partitions_created += 1;
            }
            StorageOp::WaitForPartitions { disk, expected } => {
                self.wait_for_partitions(disk, expected)?
            }
            StorageOp::LuksFormat { device, label, encryption } => {
                let key = self.key_path()?.to_path_buf();
                self.devices.luks_format(device, encryption, label, &key)?;
                self.report.luks_formatted += 1;
            }
            StorageOp::LuksOpen { device, mapper } => {
                let key = self.key_path()?.to_path_buf();
                self.devices.luks_open(device, mapper, &key)?;
                self.report.mappings_opened += 1;
                self.report.active_mappings.push(mapper.clone());
            }
            StorageOp::FormatFs { device, request, .. } => {
                self.devices.format(device, request)?;
                self.report.filesystems_created += 1;
            }
            StorageOp::LuksClose { mapper } => {
                self.devices.luks_close(mapper)?;
                self.report.mappings_closed += 1;
                self.report.active_mappings.retain(|m| m != mapper);
            }
            StorageOp::CreateDir { path } => self.devices.create_dir_all(path)?,
            StorageOp::MountScratch { device, target } => {
                self.devices.mount(device, target, "btrfs", "subvolid=5")?
            }
            StorageOp::CreateSubvolume { path } => {
                self.devices.create_subvolume(path)?;
                self.report.subvolumes_created += 1;
            }
            StorageOp::SetNoCow { path } => self.devices.set_nocow(path)?,
            StorageOp::UnmountScratch { target } => self.devices.unmount(target)?,
            StorageOp::Mount { source, target } => {
                self.mount_with_retries(source, target)?;
                self.report.mounted.push(target.clone());
            }
            StorageOp::SwapOn { source } => {
                self.devices.swap_on(&source.device)?;
                self.report.swaps_activated.push(source.device.clone());
            }
            StorageOp::WriteMountTable { path, sources } => self.write_mount_table(path, sources)?,
            StorageOp::WriteCrypttab { path, volumes } => self.write_crypttab(path, volumes)?,
        }
        Ok(())
    }

    /// Re-read the table, then poll until every node exists or the wait runs out.
    fn wait_for_partitions(&mut self, disk: &Path, expected: &[PathBuf]) -> Result<()> {
        self.devices.reread_partitions(disk)?;

        let poll = self.settings.partition_poll();
        let max_polls = (self.settings.partition_wait().as_millis() / poll.as_millis().max(1)).max(1);
        let mut polls: u32 = 0;
        loop {
            let missing = expected.iter().find(|node| !self.devices.is_block_device(node));
            match missing {
                None => {
                    debug!("{} partition node(s) ready on {} after {} poll(s)", expected.len(), disk.display(), polls);
                    return Ok(());
                }
                Some(node) if u128::from(polls) >= max_polls => {
                    return Err(ProvisionError::PartitionNotReady {
                        device: node.clone(),
                        waited: poll * polls,
                    });
                }
                Some(node) => {
                    debug!("waiting for {}", node.display());
                    polls += 1;
                    thread::sleep(poll);
                }
            }
        }
    }

    fn mount_with_retries(&mut self, source: &MountSource, target: &Path) -> Result<()> {
        let attempts = self.settings.mount_retries + 1;
        let mut attempt = 1;
        loop {
            let result = self.devices.mount(
                &source.device,
                target,
                source.entry.fs.blkid_type(),
                &source.entry.options,
            );
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        "mount {} failed (attempt {}/{}): {}",
                        target.display(),
                        attempt,
                        attempts,
                        e
                    );
                    attempt += 1;
                    thread::sleep(self.settings.mount_retry_delay());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run mount ops; a failure only skips the ops that depend on it.
    fn run_mount_stage(&mut self, storage: &StoragePlan) -> Result<()> {
        let mut failed: BTreeSet<usize> = BTreeSet::new();
        let mut failures: Vec<FailedMount> = Vec::new();
        let mut first_error: Option<ProvisionError> = None;

        for (index, planned) in storage.ops_in(ProvisionStage::Mounting) {
            self.check_interrupt()?;

            if let Some(&dep) = planned.depends_on.iter().find(|d| failed.contains(d)) {
                let reason = format!("skipped: depends on failed {}", storage.ops[dep].op);
                warn!("{}: {}", planned.op, reason);
                failed.insert(index);
                failures.extend(failed_mount(&planned.op, reason));
                continue;
            }

            match self.run_op(planned) {
                Ok(()) => self.last_step = planned.op.to_string(),
                Err(e) => {
                    warn!("{} failed: {}", planned.op, e);
                    failed.insert(index);
                    failures.extend(failed_mount(&planned.op, e.to_string()));
                    if first_error.is_none() {
                        first_error = Some(e.in_step(format!("{}: {}", planned.stage, planned.op)));
                    }
                }
            }
        }

        if !failures.is_empty() {
            return Err(ProvisionError::MountFailure { failures });
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn write_mount_table(&mut self, path: &Path, sources: &[MountSource]) -> Result<()> {
        let mut table = MountTable::new();
        for source in sources {
            let uuid = probed_uuid(&*self.devices, &source.device)?;
            let entry = &source.entry;
            let mount_point = entry
                .mount_point
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string());
            table.push_comment(&format!("{} {}", source.device.display(), entry.describe()));
            table.replace(FstabEntry::by_uuid(
                &uuid,
                &mount_point,
                entry.fs.blkid_type(),
                &entry.options,
                entry.dump,
                entry.pass,
            ));
        }

        self.devices.write_file_atomic(path, &table.render())?;
        info!("wrote {} ({} entries)", path.display(), table.len());
        self.report.mount_table = table.entries().cloned().collect();
        Ok(())
    }

    fn write_crypttab(&mut self, path: &Path, volumes: &[CryptVolume]) -> Result<()> {
        let mut tab = Crypttab::new();
        for volume in volumes {
            let uuid = probed_uuid(&*self.devices, &volume.container)?;
            tab.replace(CrypttabEntry::luks(&volume.mapper, &uuid));
        }

        self.devices.write_file_atomic(path, &tab.render())?;
        info!("wrote {} ({} volumes)", path.display(), volumes.len());
        self.report.crypttab = tab.entries().cloned().collect();
        Ok(())
    }
}

/// Passphrase source for encrypted plans; `None` when nothing is encrypted.
fn resolve_key(plan: &Plan, settings: &Settings, options: &ApplyOptions) -> Result<Option<KeyMaterial>> {
    if !plan.needs_passphrase() {
        return Ok(None);
    }
    if let Some(path) = &options.key_file {
        if !path.is_file() {
            return Err(ProvisionError::config(format!(
                "key file {} does not exist",
                path.display()
            )));
        }
        debug!("using key file {}", path.display());
        return Ok(Some(KeyMaterial::External(path.clone())));
    }
    match options.passphrase.as_deref().filter(|p| !p.is_empty()) {
        Some(passphrase) => Ok(Some(KeyMaterial::Staged(SecretFile::new(passphrase)?))),
        None => Err(ProvisionError::MissingPassphrase {
            env_var: settings.passphrase_env.clone(),
        }),
    }
}

/// Busy and existing-LUKS checks over every target disk.
fn check_devices<P: BlockProbe + ?Sized>(probe: &P, plan: &Plan, force: bool) -> Result<()> {
    for disk in &plan.disks {
        if let Some(reason) = device_busy_reason(probe, &disk.device)? {
            return Err(ProvisionError::DeviceBusy {
                device: disk.device.clone(),
                reason,
            });
        }
    }

    let mut luks = Vec::new();
    for disk in &plan.disks {
        let mut candidates = vec![disk.device.clone()];
        candidates.extend(probe.partitions_of(&disk.device)?);
        for device in candidates {
            if probe.probe(&device)?.as_ref().is_some_and(BlockInfo::is_luks) {
                luks.push(device.display().to_string());
            }
        }
    }
    if luks.is_empty() {
        return Ok(());
    }
    if force {
        warn!("--force: overwriting existing LUKS volume(s) {}", luks.join(", "));
        Ok(())
    } else {
        Err(ProvisionError::refused(format!(
            "existing LUKS volume(s) {} would be destroyed; pass --force to overwrite",
            luks.join(", ")
        )))
    }
}

fn probed_uuid<P: BlockProbe + ?Sized>(probe: &P, device: &Path) -> Result<String> {
    probe
        .probe(device)?
        .and_then(|info| info.uuid)
        .filter(|uuid| !uuid.is_empty())
        .ok_or_else(|| {
            ProvisionError::command(
                format!("blkid -p -o export {}", device.display()),
                "no UUID reported",
            )
        })
}

/// The mount-table entry an op was responsible for, if any.
fn failed_mount(op: &StorageOp, reason: String) -> Option<FailedMount> {
    match op {
        StorageOp::Mount { source, target } => Some(FailedMount {
            mount_point: target.clone(),
            source: format!("{} ({})", source.device.display(), source.entry.describe()),
            reason,
        }),
        StorageOp::SwapOn { source } => Some(FailedMount {
            mount_point: PathBuf::from("none"),
            source: format!("{} ({})", source.device.display(), source.entry.describe()),
            reason,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::{DeviceCall, FakeDevices};
    use crate::plan::size::GIB;

    fn settings() -> Settings {
        Settings {
            partition_wait_ms: 20,
            partition_poll_ms: 1,
            mount_retry_delay_ms: 0,
            ..Settings::default()
        }
    }

    fn simple_plan() -> Plan {
        Plan::from_toml_str(
            r#"
[[disk]]
device = "/dev/sda"

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

[[subvolume]]
filesystem = "ROOT"
name = "@"
mount_point = "/"
"#,
        )
        .expect("plan parses") // test: known-good input
    }

    fn fake() -> FakeDevices {
        FakeDevices::new().with_disk("/dev/sda", 64 * GIB)
    }

    fn confirmed() -> ApplyOptions {
        ApplyOptions {
            confirmation: Some(ConfirmationToken::confirm("test")),
            ..ApplyOptions::default()
        }
    }

    #[test]
    fn test_apply_simple_plan() {
        let mut devices = fake();
        let report = apply(&simple_plan(), &mut devices, &settings(), &confirmed()).expect("apply");

        assert_eq!(report.partitions_created, 2);
        assert_eq!(report.subvolumes_created, 1);
        assert_eq!(report.mounted, vec![PathBuf::from("/mnt"), PathBuf::from("/mnt/boot")]);
        assert_eq!(report.mount_table.len(), 2);
        assert!(report.mount_table.iter().all(FstabEntry::is_uuid_keyed));
        assert_eq!(report.stages.last(), Some(&ProvisionStage::Completed));

        let fstab = devices.file(Path::new("/mnt/etc/fstab")).expect("fstab written");
        assert!(fstab.contains("\t/\tbtrfs\tsubvol=/@"));
        assert!(fstab.contains("\t/boot\tvfat\t"));
    }

    #[test]
    fn test_refuses_without_confirmation() {
        let mut devices = fake();
        let err = apply(&simple_plan(), &mut devices, &settings(), &ApplyOptions::default())
            .expect_err("refused");
        assert!(matches!(err, ProvisionError::DestructiveOperationRefused { .. }));
        assert_eq!(devices.mutation_count(), 0);
    }

    #[test]
    fn test_invalid_plan_checked_before_confirmation() {
        let mut devices = FakeDevices::new();
        let err = apply(&simple_plan(), &mut devices, &settings(), &confirmed()).expect_err("invalid");
        assert!(matches!(err, ProvisionError::InvalidPlan { .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_VALIDATION);
        assert_eq!(devices.mutation_count(), 0);
    }

    #[test]
    fn test_encrypted_plan_needs_passphrase() {
        let mut plan = simple_plan();
        plan.disks[0].partitions[1].encryption = Some(Default::default());
        let mut devices = fake();
        let err = apply(&plan, &mut devices, &settings(), &confirmed()).expect_err("no passphrase");
        assert!(matches!(err, ProvisionError::MissingPassphrase { .. }));
        assert_eq!(devices.mutation_count(), 0);
    }

    #[test]
    fn test_partition_not_ready() {
        let mut devices = fake().withhold_partition_nodes();
        let err = apply(&simple_plan(), &mut devices, &settings(), &confirmed()).expect_err("timeout");
        assert!(matches!(err.root_cause(), ProvisionError::PartitionNotReady { .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_EXECUTION);
        assert!(err.step().is_some_and(|s| s.contains("WaitForPartitions")));
    }

    #[test]
    fn test_slow_partition_nodes_are_waited_for() {
        let mut devices = fake().with_node_delay(3);
        apply(&simple_plan(), &mut devices, &settings(), &confirmed()).expect("apply after delay");
    }

    #[test]
    fn test_mount_retried_then_succeeds() {
        let mut devices = fake().fail_mount("/mnt/boot", 2);
        apply(&simple_plan(), &mut devices, &settings(), &confirmed()).expect("retries absorb failures");
        let boot_mounts = devices.count_calls(|c| {
            matches!(c, DeviceCall::Mount { target, .. } if target == Path::new("/mnt/boot"))
        });
        assert_eq!(boot_mounts, 3);
    }

    #[test]
    fn test_interrupt_stops_at_step_boundary() {
        let flag = InterruptFlag::new();
        flag.raise();
        let options = ApplyOptions {
            interrupt: Some(flag),
            ..confirmed()
        };
        let mut devices = fake();
        let err = apply(&simple_plan(), &mut devices, &settings(), &options).expect_err("interrupted");
        assert!(matches!(err, ProvisionError::Interrupted { ref after_step } if after_step == "start"));
        assert_eq!(devices.mutation_count(), 0);
    }

    #[test]
    fn test_busy_disk_refused() {
        let mut devices = fake();
        apply(&simple_plan(), &mut devices, &settings(), &confirmed()).expect("first apply");
        let before = devices.mutation_count();

        let err = apply(&simple_plan(), &mut devices, &settings(), &confirmed()).expect_err("busy");
        assert!(matches!(err, ProvisionError::DeviceBusy { .. }));
        assert_eq!(devices.mutation_count(), before);
    }
}
