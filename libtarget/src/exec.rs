//! Local command execution.
//!
//! Every tool the exporter and the LVM driver shell out to (`tgt-admin`,
//! `lvcreate`, `iscsiadm`, `sar`, ...) goes through an [`Executor`], so tests
//! can substitute a scripted fake.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::TargetError;

/// Runs a program and returns its stdout.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `program` with `args`. A non-zero exit status is an error carrying
    /// the captured stderr.
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, TargetError>;
}

/// [`Executor`] backed by [`tokio::process::Command`].
///
/// Commands run with `LC_ALL=C` so tool output parses the same on every
/// host.
#[derive(Debug, Default, Clone)]
pub struct ShellExecutor;

#[async_trait]
impl Executor for ShellExecutor {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, TargetError> {
        let cmdline = format_command(program, args);
        debug!(command = %cmdline, "exec");

        let output = Command::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .output()
            .await
            .map_err(|e| TargetError::command(&cmdline, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let reason = if stderr.trim().is_empty() {
                format!("{}: {}", output.status, stdout.trim())
            } else {
                format!("{}: {}", output.status, stderr.trim())
            };
            return Err(TargetError::command(cmdline, reason));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Render a command line for logs and error messages.
pub fn format_command(program: &str, args: &[&str]) -> String {
    let mut line = program.to_owned();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}
