//! Verifier round trips on the in-memory backend
//!
//! These tests verify:
//! - Verification is read-only and repeatable
//! - The generic checklist passes on a provisioned root
//! - Drift after provisioning turns into findings, not errors

mod common;

use std::path::Path;

use archdisk::device::DeviceOps;
use archdisk::device::fake::FakeDevices;
use archdisk::executor::apply;
use archdisk::plan::Plan;
use archdisk::plan::size::GIB;
use archdisk::types::Status;
use archdisk::verify::{verify_plan, verify_system};

use common::{confirmed, fast_settings, install_helpers, workstation_devices, workstation_plan};

#[test]
fn test_verify_is_idempotent_and_read_only() {
    let settings = fast_settings();
    let plan = workstation_plan();
    let mut devices = workstation_devices();
    apply(&plan, &mut devices, &settings, &confirmed()).expect("apply");
    let before = devices.mutation_count();

    let first = verify_plan(&plan, &devices, &settings, None).expect("first verify");
    let second = verify_plan(&plan, &devices, &settings, None).expect("second verify");
    assert_eq!(first.findings, second.findings);
    assert_eq!(first.to_text(), second.to_text());
    assert_eq!(devices.mutation_count(), before);
}

#[test]
fn test_generic_checklist_on_provisioned_root() {
    let settings = fast_settings();
    let mut devices = workstation_devices();
    apply(&workstation_plan(), &mut devices, &settings, &confirmed()).expect("apply");
    install_helpers(&mut devices, &settings, Path::new("/mnt"));

    let report = verify_system(&devices, &settings, None).expect("verify");
    let not_pass: Vec<String> = report
        .findings
        .iter()
        .filter(|f| f.status != Status::Pass)
        .map(|f| f.to_string())
        .collect();
    assert!(not_pass.is_empty(), "{:#?}", not_pass);
    assert!(report.to_text().ends_with(&format!("PASS: {} pass, 0 warn, 0 fail\n", report.findings.len())));
}

#[test]
fn test_missing_helpers_only_warn() {
    let settings = fast_settings();
    let plan = workstation_plan();
    let mut devices = workstation_devices();
    apply(&plan, &mut devices, &settings, &confirmed()).expect("apply");

    let report = verify_plan(&plan, &devices, &settings, None).expect("verify");
    assert_eq!(report.overall(), Status::Warn);
    let warned: Vec<&str> = report
        .findings
        .iter()
        .filter(|f| f.status == Status::Warn)
        .map(|f| f.check.as_str())
        .collect();
    assert_eq!(warned, vec!["helper", "helper"]);
}

#[test]
fn test_unmounted_home_fails() {
    let settings = fast_settings();
    let plan = workstation_plan();
    let mut devices = workstation_devices();
    apply(&plan, &mut devices, &settings, &confirmed()).expect("apply");
    install_helpers(&mut devices, &settings, Path::new("/mnt"));

    devices.unmount(Path::new("/mnt/home/vms")).expect("unmount vms"); // test: mounted by apply
    devices.unmount(Path::new("/mnt/home")).expect("unmount home"); // test: mounted by apply

    let report = verify_plan(&plan, &devices, &settings, None).expect("verify");
    assert_eq!(report.overall(), Status::Fail);
    let failed: Vec<&str> = report.failures().map(|f| f.subject.as_str()).collect();
    assert_eq!(failed, vec!["/home", "/home/vms"]);
}

#[test]
fn test_unmounted_cache_only_warns() {
    let settings = fast_settings();
    let plan = workstation_plan();
    let mut devices = workstation_devices();
    apply(&plan, &mut devices, &settings, &confirmed()).expect("apply");
    install_helpers(&mut devices, &settings, Path::new("/mnt"));
    devices.unmount(Path::new("/mnt/cache")).expect("unmount cache"); // test: mounted by apply

    let report = verify_plan(&plan, &devices, &settings, None).expect("verify");
    assert_eq!(report.overall(), Status::Warn);
    let cache = report
        .findings
        .iter()
        .find(|f| f.check == "mount" && f.subject == "/cache")
        .expect("cache finding"); // test: plan mounts /cache
    assert_eq!(cache.status, Status::Warn);
}

#[test]
fn test_json_report_shape() {
    let settings = fast_settings();
    let plan = workstation_plan();
    let mut devices = workstation_devices();
    apply(&plan, &mut devices, &settings, &confirmed()).expect("apply");
    install_helpers(&mut devices, &settings, Path::new("/mnt"));

    let report = verify_plan(&plan, &devices, &settings, None).expect("verify");
    let json: serde_json::Value =
        serde_json::from_str(&report.to_json().expect("json")).expect("valid json"); // test: serializer output
    assert_eq!(json["overall"], "pass");
    assert_eq!(json["root"], "/mnt");
    assert_eq!(json["summary"]["fail"], 0);
    assert_eq!(
        json["findings"].as_array().map(Vec::len),
        Some(report.findings.len())
    );
}

#[test]
fn test_missing_root_mount_fails_without_roles() {
    let settings = fast_settings();
    let plan = Plan::from_toml_str(
        r#"
[[disk]]
device = "/dev/vda"

[[disk.partition]]
label = "SYSTEM"
filesystem = "btrfs"
size = "remainder"
mount_point = "/"
"#,
    )
    .expect("plan parses"); // test: known-good input
    let mut devices = FakeDevices::new().with_disk("/dev/vda", 32 * GIB);
    apply(&plan, &mut devices, &settings, &confirmed()).expect("apply");
    devices.unmount_all();

    let report = verify_plan(&plan, &devices, &settings, None).expect("verify");
    assert_eq!(report.overall(), Status::Fail);
    let root = report
        .findings
        .iter()
        .find(|f| f.check == "mount" && f.subject == "/")
        .expect("root mount finding"); // test: plan mounts /
    assert_eq!(root.status, Status::Fail);
}
