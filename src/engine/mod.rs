//! Engine modules: the layer that turns a plan into an ordered operation list.
//!
//! The engine sits between the plan (what the disks should look like) and the
//! executor (which device operations to run). It generates ordered, checked
//! operation plans and never touches a device.

pub mod storage;

pub use storage::{CryptVolume, MountSource, PlannedOp, StorageOp, StoragePlan, compile};
