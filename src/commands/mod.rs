//! Type-safe argument modules for external disk tools.
//!
//! Each struct implements `CommandArgs` and maps Rust fields to the exact
//! flags the corresponding binary expects.

pub mod disk;
pub mod encryption;
pub mod filesystem;
