//! Type-safe external command execution.
//!
//! All disk tool invocations go through [`run_command`] so that every executed
//! command line is logged and every failure carries the exact command that
//! was attempted.

use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::command_traits::CommandArgs;
use crate::error::{ProvisionError, Result};
use crate::interrupt::CommandProcessGroup;

/// Execute an external command with typed arguments.
///
/// Spawn failures become `ProvisionError::Command`. A non-zero exit is NOT an
/// error here; call [`CommandOutput::ensure_success`] (or use [`run_checked`])
/// when the caller needs one.
pub fn run_command<T: CommandArgs>(args: &T) -> Result<CommandOutput> {
    let command_line = args.command_line();
    if args.is_destructive() {
        info!("exec (destructive): {}", command_line);
    } else {
        info!("exec: {}", command_line);
    }

    let output = Command::new(args.program())
        .args(args.to_cli_args())
        .in_new_process_group()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| ProvisionError::command(&command_line, format!("failed to spawn: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code();

    debug!(
        command = %command_line,
        exit_code = ?exit_code,
        "command finished"
    );

    Ok(CommandOutput {
        command_line,
        stdout,
        stderr,
        exit_code,
        success: output.status.success(),
    })
}

/// Run a command and fail on non-zero exit.
pub fn run_checked<T: CommandArgs>(args: &T) -> Result<CommandOutput> {
    let output = run_command(args)?;
    output.ensure_success()?;
    Ok(output)
}

/// Output from a command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// The exact command line that ran.
    pub command_line: String,
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Return `ProvisionError::Command` with the exit code and stderr if the
    /// command did not succeed.
    pub fn ensure_success(&self) -> Result<()> {
        if self.success {
            return Ok(());
        }
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() {
            format!("exit code {}", code)
        } else {
            format!("exit code {}: {}", code, stderr)
        };
        Err(ProvisionError::command(&self.command_line, detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str);

    impl CommandArgs for Echo {
        fn program(&self) -> &'static str {
            "echo"
        }

        fn to_cli_args(&self) -> Vec<String> {
            vec![self.0.to_string()]
        }
    }

    struct Missing;

    impl CommandArgs for Missing {
        fn program(&self) -> &'static str {
            "archdisk-no-such-binary"
        }

        fn to_cli_args(&self) -> Vec<String> {
            vec!["--flag".to_string()]
        }
    }

    #[test]
    fn test_run_command_captures_stdout() {
        let out = run_checked(&Echo("hello")).expect("echo runs"); // test: coreutils present
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.command_line, "echo hello");
    }

    #[test]
    fn test_spawn_failure_reports_command() {
        let err = run_command(&Missing).expect_err("binary does not exist");
        assert_eq!(err.failed_command(), Some("archdisk-no-such-binary --flag"));
    }

    #[test]
    fn test_ensure_success_reports_stderr() {
        let out = CommandOutput {
            command_line: "mkfs.btrfs -f /dev/sdz".to_string(),
            stdout: String::new(),
            stderr: "ERROR: not enough free space\n".to_string(),
            exit_code: Some(1),
            success: false,
        };
        let err = out.ensure_success().expect_err("non-zero exit");
        let msg = err.to_string();
        assert!(msg.contains("mkfs.btrfs -f /dev/sdz"));
        assert!(msg.contains("exit code 1: ERROR: not enough free space"));
    }
}
