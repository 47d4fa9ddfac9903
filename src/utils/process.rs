//! Bounded execution of external processes
//!
//! Every helper binary the controller drives (partition mapper, mount,
//! rsync, power controller, export reload) goes through [`run_command`], so a
//! hung process surfaces as an error instead of holding a node lock forever.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Captured result of a finished process
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the process exited with status 0
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stderr if present, otherwise stdout, trimmed
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Run `program` with `args`, optionally feeding `stdin`, killing it after
/// `timeout`.
///
/// A non-zero exit is not an error here; callers inspect [`CommandOutput`].
pub async fn run_command<I, S>(
    program: &str,
    args: I,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| Error::command(program, format!("failed to spawn: {e}")))?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input)
                .await
                .map_err(|e| Error::command(program, format!("failed to write stdin: {e}")))?;
            // Dropping the pipe closes stdin so the child sees EOF
        }
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| Error::command(program, format!("timed out after {timeout:?}")))?
        .map_err(|e| Error::command(program, format!("failed to wait: {e}")))?;

    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command and require a zero exit status
pub async fn run_checked<I, S>(program: &str, args: I, timeout: Duration) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_command(program, args, None, timeout).await?;
    if !output.success() {
        return Err(Error::command(
            program,
            format!("exited with {}: {}", output.status, output.diagnostic()),
        ));
    }
    Ok(output)
}
