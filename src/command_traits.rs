//! Type-safe external command contracts.
//!
//! Every disk tool invocation (`parted`, `mkfs.btrfs`, `cryptsetup`, ...) is
//! described by a struct implementing [`CommandArgs`] instead of a raw string
//! vector. The struct definition is the contract: a misspelled flag is a
//! compile error in one place rather than a runtime failure on a live disk.

/// Trait for typed command arguments.
///
/// # Contract
///
/// - `program()`: the binary name, resolved through `PATH` at execution time.
/// - `to_cli_args()`: arguments exactly as the tool expects them.
/// - Secrets never appear in `to_cli_args()`; passphrases travel via keyfile.
///
/// # Example
///
/// ```ignore
/// use archdisk::command_traits::CommandArgs;
/// use archdisk::commands::disk::WipeSignaturesArgs;
///
/// let args = WipeSignaturesArgs { device: PathBuf::from("/dev/sda") };
/// assert_eq!(args.command_line(), "wipefs --all --force /dev/sda");
/// ```
pub trait CommandArgs {
    /// The binary to execute (e.g., "mkfs.btrfs").
    fn program(&self) -> &'static str;

    /// Convert struct fields to command-line arguments.
    fn to_cli_args(&self) -> Vec<String>;

    /// Whether this command destroys existing data.
    ///
    /// Defaults to false. Override for wipe/format operations.
    fn is_destructive(&self) -> bool {
        false
    }

    /// The full command line, as logged and reported on failure.
    fn command_line(&self) -> String {
        let mut parts = vec![self.program().to_string()];
        parts.extend(self.to_cli_args());
        parts.join(" ")
    }
}
