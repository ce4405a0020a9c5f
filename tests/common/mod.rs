//! Shared fixtures: the three-disk workstation layout on the in-memory backend.
#![allow(dead_code)]

use std::path::Path;

use archdisk::device::DeviceOps;
use archdisk::device::fake::FakeDevices;
use archdisk::executor::{ApplyOptions, ConfirmationToken};
use archdisk::plan::Plan;
use archdisk::plan::size::GIB;
use archdisk::settings::Settings;

/// D1 boots and carries the root subvolumes, D2 holds encrypted workspace and
/// home, D3 carries swap and the tool cache.
pub const WORKSTATION_PLAN: &str = r#"
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
mount_options = { compress = "zstd:3", noatime = true }

[[disk]]
device = "/dev/nvme1n1"
role = "home"

[[disk.partition]]
label = "WORKSPACE"
role = "workspace"
filesystem = "btrfs"
size = "1024GiB"
mount_point = "/workspace"
encryption = {}

[[disk.partition]]
label = "HOME"
role = "home"
filesystem = "btrfs"
size = "remainder"
encryption = {}

[[disk]]
device = "/dev/sda"
role = "swap"

[[disk.partition]]
label = "SWAP"
role = "swap"
filesystem = "swap"
size = "32GiB"

[[disk.partition]]
label = "CACHE"
role = "cache"
filesystem = "btrfs"
size = "remainder"
mount_point = "/cache"

[[subvolume]]
filesystem = "ROOT"
name = "@"
mount_point = "/"

[[subvolume]]
filesystem = "ROOT"
name = "@log"
mount_point = "/var/log"

[[subvolume]]
filesystem = "ROOT"
name = "@snapshots"
mount_point = "/.snapshots"

[[subvolume]]
filesystem = "HOME"
name = "@home"
mount_point = "/home"

[[subvolume]]
filesystem = "HOME"
name = "@vms"
mount_point = "/home/vms"
mount_options = { nodatacow = true }
"#;

pub fn workstation_plan() -> Plan {
    Plan::from_toml_str(WORKSTATION_PLAN).expect("workstation plan parses") // test: fixture
}

pub fn workstation_devices() -> FakeDevices {
    FakeDevices::new()
        .with_disk("/dev/nvme0n1", 512 * GIB)
        .with_disk("/dev/nvme1n1", 2048 * GIB)
        .with_disk("/dev/sda", 256 * GIB)
}

/// Default settings with the waits shrunk for tests.
pub fn fast_settings() -> Settings {
    Settings {
        partition_wait_ms: 20,
        partition_poll_ms: 1,
        mount_retry_delay_ms: 0,
        ..Settings::default()
    }
}

pub fn confirmed() -> ApplyOptions {
    ApplyOptions {
        confirmation: Some(ConfirmationToken::confirm("test")),
        passphrase: Some("correct horse battery staple".to_string()),
        ..ApplyOptions::default()
    }
}

/// Install the helper scripts the verifier looks for under `root`.
pub fn install_helpers(devices: &mut FakeDevices, settings: &Settings, root: &Path) {
    for script in &settings.helper_scripts {
        let path = root.join(script.strip_prefix("/").expect("absolute helper path")); // test: default settings
        let parent = path.parent().expect("helper has a parent"); // test: default settings
        devices.create_dir_all(parent).expect("create helper dir"); // test: fake backend
        devices
            .write_file_atomic(&path, "#!/bin/sh\n")
            .expect("write helper"); // test: fake backend
    }
}
