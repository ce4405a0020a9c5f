//! Error handling module for archdisk
//!
//! Provides the provisioning error taxonomy using thiserror. Every failure
//! carries enough context to print the failing step, the exact external
//! command that was attempted, and a suggested remediation.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Exit code: success.
pub const EXIT_OK: i32 = 0;
/// Exit code: the plan or configuration was rejected before any mutation.
pub const EXIT_VALIDATION: i32 = 1;
/// Exit code: execution failed, devices may be in a partially applied state.
pub const EXIT_EXECUTION: i32 = 2;
/// Exit code: verification produced at least one `Fail` finding.
pub const EXIT_VERIFICATION: i32 = 3;

/// One mount entry that could not be mounted during the mount phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMount {
    pub mount_point: PathBuf,
    pub source: String,
    pub reason: String,
}

impl std::fmt::Display for FailedMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.mount_point.display(),
            self.source,
            self.reason
        )
    }
}

fn describe_failures(failures: &[FailedMount]) -> String {
    let noun = if failures.len() == 1 { "entry" } else { "entries" };
    let list: Vec<String> = failures.iter().map(|f| f.to_string()).collect();
    format!("{} {}: {}", failures.len(), noun, list.join("; "))
}

/// Main error type for archdisk
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Static plan problems, found before any device is touched
    #[error("Invalid plan: {}", .issues.join("; "))]
    InvalidPlan { issues: Vec<String> },

    /// A device referenced by the plan is missing
    #[error("Device not found: {}", .device.display())]
    DeviceNotFound { device: PathBuf },

    /// A target device is mounted, used as swap, or held by a mapping
    #[error("Device {} is busy: {reason}", .device.display())]
    DeviceBusy { device: PathBuf, reason: String },

    /// Partition device nodes did not appear within the bounded wait
    #[error("Partition {} did not appear after {waited:?}", .device.display())]
    PartitionNotReady { device: PathBuf, waited: Duration },

    /// Missing confirmation token, or an existing LUKS volume without force
    #[error("Destructive operation refused: {reason}")]
    DestructiveOperationRefused { reason: String },

    /// One or more mount entries failed; lists every affected entry
    #[error("Mount phase failed for {}", describe_failures(.failures))]
    MountFailure { failures: Vec<FailedMount> },

    /// Verification found `Fail`-level findings
    #[error("Verification failed: {failed} required check(s) did not pass")]
    VerificationFailed { failed: usize },

    /// An external command exited unsuccessfully or could not be spawned
    #[error("Command `{command}` failed: {detail}")]
    Command { command: String, detail: String },

    /// Wraps a failure with the provisioning step it happened in
    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<ProvisionError>,
    },

    /// An interrupt was honored at a step boundary
    #[error("Interrupted after step '{after_step}'")]
    Interrupted { after_step: String },

    /// Encrypted partitions need a passphrase and none was supplied
    #[error("No passphrase available: set {env_var} or pass --key-file")]
    MissingPassphrase { env_var: String },

    /// Settings errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors (mount table writes, directory creation, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML plan parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias for archdisk operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Create an invalid plan error from a single issue
    pub fn invalid_plan(issue: impl Into<String>) -> Self {
        Self::InvalidPlan {
            issues: vec![issue.into()],
        }
    }

    /// Create a command failure
    pub fn command(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            detail: detail.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a refusal for a destructive operation
    pub fn refused(reason: impl Into<String>) -> Self {
        Self::DestructiveOperationRefused {
            reason: reason.into(),
        }
    }

    /// Attach the failing step to this error.
    ///
    /// Already-wrapped errors keep their innermost step.
    pub fn in_step(self, step: impl Into<String>) -> Self {
        match self {
            Self::Step { .. } => self,
            other => Self::Step {
                step: step.into(),
                source: Box::new(other),
            },
        }
    }

    /// Strip `Step` wrappers and return the underlying error.
    pub fn root_cause(&self) -> &ProvisionError {
        match self {
            Self::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// The step this error happened in, if known.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::Step { step, .. } => Some(step),
            _ => None,
        }
    }

    /// The exact external command that failed, if any.
    pub fn failed_command(&self) -> Option<&str> {
        match self.root_cause() {
            Self::Command { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            Self::InvalidPlan { .. }
            | Self::Config(_)
            | Self::Json(_)
            | Self::Toml(_)
            | Self::MissingPassphrase { .. } => EXIT_VALIDATION,
            Self::VerificationFailed { .. } => EXIT_VERIFICATION,
            _ => EXIT_EXECUTION,
        }
    }

    /// Suggested remediation printed under the error.
    pub fn remediation(&self) -> String {
        match self.root_cause() {
            Self::InvalidPlan { .. } => {
                "Fix the listed plan issues and re-run `archdisk plan validate`.".to_string()
            }
            Self::DeviceNotFound { device } => format!(
                "Check the device path with `lsblk -d`; {} may have been renumbered.",
                device.display()
            ),
            Self::DeviceBusy { device, .. } => format!(
                "Unmount everything on {dev} (`umount -R`), `swapoff` its partitions and \
                 close LUKS mappings (`cryptsetup close`) before retrying.",
                dev = device.display()
            ),
            Self::PartitionNotReady { .. } => {
                "Run `partprobe` and `udevadm settle`, or raise partition_wait_ms in the settings."
                    .to_string()
            }
            Self::DestructiveOperationRefused { .. } => {
                "Review the plan with `archdisk plan show`, then re-run with --confirm \
                 (and --force to overwrite existing LUKS volumes)."
                    .to_string()
            }
            Self::MountFailure { .. } => {
                "Partial mount state is left in place. Inspect with `findmnt`, fix the failing \
                 entries, then `umount -R` the target root and re-run."
                    .to_string()
            }
            Self::VerificationFailed { .. } => {
                "Address each FAIL finding; re-run `archdisk verify` to confirm.".to_string()
            }
            Self::Command { command, .. } => format!(
                "Re-run `{command}` manually to inspect its output; the device may be \
                 partially provisioned."
            ),
            Self::Interrupted { .. } => {
                "Provisioning stopped between steps. Inspect the devices before re-running."
                    .to_string()
            }
            Self::MissingPassphrase { env_var } => {
                format!("Export {env_var} or pass --key-file <path>.")
            }
            Self::Config(_) => "Check the settings file passed with --config.".to_string(),
            Self::Io(_) => "Check permissions and free space on the target.".to_string(),
            Self::Json(_) | Self::Toml(_) => "Check the plan file syntax.".to_string(),
            Self::Step { .. } => unreachable!("root_cause never returns Step"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProvisionError::invalid_plan("duplicate label ROOT");
        assert_eq!(err.to_string(), "Invalid plan: duplicate label ROOT");

        let err = ProvisionError::refused("missing --confirm");
        assert_eq!(
            err.to_string(),
            "Destructive operation refused: missing --confirm"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ProvisionError = io_err.into();
        assert!(matches!(err, ProvisionError::Io(_)));
    }

    #[test]
    fn test_step_wrapping_keeps_command() {
        let err = ProvisionError::command("mkfs.btrfs -f /dev/sda2", "exit 1")
            .in_step("format ROOT")
            .in_step("outer");
        assert_eq!(err.step(), Some("format ROOT"));
        assert_eq!(err.failed_command(), Some("mkfs.btrfs -f /dev/sda2"));
        assert_eq!(err.exit_code(), EXIT_EXECUTION);
        assert!(err.remediation().contains("mkfs.btrfs"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            ProvisionError::invalid_plan("x").exit_code(),
            EXIT_VALIDATION
        );
        assert_eq!(
            ProvisionError::VerificationFailed { failed: 2 }.exit_code(),
            EXIT_VERIFICATION
        );
        assert_eq!(ProvisionError::refused("x").exit_code(), EXIT_EXECUTION);
    }

    #[test]
    fn test_mount_failure_lists_entries() {
        let err = ProvisionError::MountFailure {
            failures: vec![
                FailedMount {
                    mount_point: PathBuf::from("/home"),
                    source: "UUID=abc".to_string(),
                    reason: "mount exited 32".to_string(),
                },
                FailedMount {
                    mount_point: PathBuf::from("/home/dev"),
                    source: "UUID=abc".to_string(),
                    reason: "parent not mounted".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 entries"));
        assert!(msg.contains("/home/dev"));
    }
}
