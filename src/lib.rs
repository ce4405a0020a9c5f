//! archdisk library
//!
//! Declarative disk provisioning for Arch Linux installs: a [`Plan`] is
//! validated, compiled into an ordered [`StoragePlan`], applied through a
//! [`DeviceOps`] backend and audited by the verifier.

pub mod cache;
pub mod cli;
pub mod command_runner;
pub mod command_traits;
pub mod commands;
pub mod device;
pub mod engine;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod mount_table;
pub mod plan;
pub mod preflight;
pub mod provision_state;
pub mod repair;
pub mod settings;
pub mod types;
pub mod verify;

// Re-export main types for convenience
pub use device::{BlockProbe, DeviceOps};
pub use engine::{StorageOp, StoragePlan, compile};
pub use error::{ProvisionError, Result};
pub use executor::{ApplyOptions, ApplyReport, ConfirmationToken, apply, dry_run};
pub use interrupt::{CommandProcessGroup, InterruptFlag};
pub use mount_table::{Crypttab, FstabEntry, MountTable};
pub use plan::{Plan, validate};
pub use provision_state::{ProvisionContext, ProvisionStage};
pub use repair::{RepairReport, repair_home};
pub use settings::Settings;
pub use types::{FsType, Role, Status, TableType};
pub use verify::{Finding, VerificationReport, verify_plan, verify_system};
