//! Property-Based Tests for archdisk
//!
//! Uses proptest for plan invariants:
//! - Overlapping partitions are always rejected
//! - Subvolumes on non-btrfs partitions are always rejected
//! - Mount order is parent-before-child, both planned and as written by apply
//! - Apply then verify yields zero Fail findings

mod common;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use proptest::prelude::*;

use archdisk::device::fake::FakeDevices;
use archdisk::error::ProvisionError;
use archdisk::executor::apply;
use archdisk::plan::size::GIB;
use archdisk::plan::validate::collect_issues;
use archdisk::plan::{Plan, ordered_mount_entries, validate};
use archdisk::types::Status;
use archdisk::verify::verify_plan;

use common::{confirmed, fast_settings};

const SEGMENTS: &[&str] = &["srv", "opt", "data", "var"];

/// Sets of absolute mount points built from a small alphabet, so nesting is common.
fn mount_points_strategy() -> impl Strategy<Value = Vec<PathBuf>> {
    prop::collection::vec(prop::collection::vec(0..SEGMENTS.len(), 1..4), 0..6).prop_map(|paths| {
        let set: BTreeSet<PathBuf> = paths
            .into_iter()
            .map(|segs| {
                let mut p = PathBuf::from("/");
                for s in segs {
                    p.push(SEGMENTS[s]);
                }
                p
            })
            .collect();
        set.into_iter().collect()
    })
}

/// ESP plus a btrfs root carrying `@` at `/` and one subvolume per mount point.
fn layered_plan(mount_points: &[PathBuf], encrypt_root: bool, with_swap: bool) -> String {
    let mut toml = String::from(
        r#"
[[disk]]
device = "/dev/vda"

[[disk.partition]]
label = "ESP"
role = "boot"
filesystem = "vfat"
size = "512MiB"
mount_point = "/boot"
"#,
    );
    if with_swap {
        toml.push_str(
            r#"
[[disk.partition]]
label = "SWAP"
role = "swap"
filesystem = "swap"
size = "2GiB"
"#,
        );
    }
    toml.push_str(
        r#"
[[disk.partition]]
label = "ROOT"
role = "root"
filesystem = "btrfs"
size = "remainder"
"#,
    );
    if encrypt_root {
        toml.push_str("encryption = {}\n");
    }
    toml.push_str(
        r#"
[[subvolume]]
filesystem = "ROOT"
name = "@"
mount_point = "/"
"#,
    );
    for (i, mp) in mount_points.iter().enumerate() {
        toml.push_str(&format!(
            "\n[[subvolume]]\nfilesystem = \"ROOT\"\nname = \"@sub{}\"\nmount_point = \"{}\"\n",
            i,
            mp.display()
        ));
    }
    toml
}

// =============================================================================
// Validation Properties
// =============================================================================

proptest! {
    /// A second partition starting inside the first is always rejected
    #[test]
    fn overlap_always_rejected(first_gib in 2u64..100, start_gib in 1u64..100) {
        prop_assume!(start_gib < first_gib);
        let toml = format!(
            r#"
[[disk]]
device = "/dev/sda"
[[disk.partition]]
label = "A"
filesystem = "btrfs"
size = "{first_gib}GiB"
[[disk.partition]]
label = "B"
filesystem = "btrfs"
size = "1GiB"
start = "{start_gib}GiB"
"#
        );
        let plan = Plan::from_toml_str(&toml).expect("plan parses");
        let devices = FakeDevices::new().with_disk("/dev/sda", 1024 * GIB);
        let err = validate(&plan, &devices).expect_err("overlap rejected");
        prop_assert!(
            matches!(err, ProvisionError::InvalidPlan { .. }),
            "expected InvalidPlan, got {:?}",
            err
        );
        prop_assert!(err.to_string().contains("overlaps partition A"));
    }

    /// Subvolumes may only live on btrfs
    #[test]
    fn subvolume_on_non_btrfs_rejected(fs in prop_oneof![Just("vfat"), Just("swap")], name in "@[a-z]{1,8}") {
        let toml = format!(
            r#"
[[disk]]
device = "/dev/sda"
[[disk.partition]]
label = "X"
filesystem = "{fs}"
size = "4GiB"
[[subvolume]]
filesystem = "X"
name = "{name}"
"#
        );
        let plan = Plan::from_toml_str(&toml).expect("plan parses");
        let devices = FakeDevices::new().with_disk("/dev/sda", 64 * GIB);
        let issues = collect_issues(&plan, &devices);
        prop_assert!(issues.iter().any(|i| i.contains("not btrfs")), "{:?}", issues);
        prop_assert!(validate(&plan, &devices).is_err());
    }

    /// Every ancestor mount point precedes its descendants
    #[test]
    fn mount_order_parent_before_child(mount_points in mount_points_strategy()) {
        let plan = Plan::from_toml_str(&layered_plan(&mount_points, false, false)).expect("plan parses");
        let ordered = ordered_mount_entries(&plan);
        let points: Vec<&Path> = ordered
            .iter()
            .filter_map(|m| m.entry.mount_point.as_deref())
            .collect();
        for (i, child) in points.iter().enumerate() {
            for (j, parent) in points.iter().enumerate() {
                if parent != child && child.starts_with(parent) {
                    prop_assert!(j < i, "{} before {}", child.display(), parent.display());
                }
            }
        }
        for m in &ordered {
            if let Some(p) = m.parent {
                let parent = ordered[p].entry.mount_point.as_deref().expect("parent has a mount point");
                let child = m.entry.mount_point.as_deref().expect("child has a mount point");
                prop_assert!(child.starts_with(parent));
            }
        }
    }
}

// =============================================================================
// Apply / Verify Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Provisioning any valid layout leaves nothing for the verifier to fail
    #[test]
    fn apply_then_verify_has_no_failures(
        mount_points in mount_points_strategy(),
        encrypt_root in any::<bool>(),
        with_swap in any::<bool>(),
    ) {
        let settings = fast_settings();
        let plan = Plan::from_toml_str(&layered_plan(&mount_points, encrypt_root, with_swap))
            .expect("plan parses");
        let mut devices = FakeDevices::new().with_disk("/dev/vda", 64 * GIB);

        let report = apply(&plan, &mut devices, &settings, &confirmed()).expect("apply");
        prop_assert_eq!(report.subvolumes_created, mount_points.len() + 1);

        // The table apply wrote lists every parent before its children
        let written: Vec<&str> = report.mount_table.iter().map(|e| e.mount_point.as_str()).collect();
        for (i, child) in written.iter().enumerate() {
            for (j, parent) in written.iter().enumerate() {
                if parent != child && parent.starts_with('/') && Path::new(child).starts_with(parent) {
                    prop_assert!(j < i, "{} written before its parent {}", child, parent);
                }
            }
        }

        let verification = verify_plan(&plan, &devices, &settings, None).expect("verify");
        let failures: Vec<String> = verification.failures().map(|f| f.to_string()).collect();
        prop_assert!(failures.is_empty(), "{:#?}", failures);
        prop_assert_ne!(verification.overall(), Status::Fail);

        let again = verify_plan(&plan, &devices, &settings, None).expect("verify again");
        prop_assert_eq!(verification.findings, again.findings);
    }
}
