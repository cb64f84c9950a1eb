//! External command execution.
//!
//! Every tool the connectors drive (`iscsiadm`, `multipath`, `blockdev`, `rbd`,
//! `lvdisplay`) goes through the [`Executor`] trait so the orchestration code
//! never touches `std::process` directly.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{ConnectorError, Result};

/// Runs an external program and returns its combined stdout/stderr.
///
/// A non-zero exit status is reported as [`ConnectorError::CommandFailed`]
/// with the combined output attached, since the tools print diagnostics on
/// either stream.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<String>;

    /// Check whether `program` can be found on `PATH`.
    async fn is_installed(&self, program: &str) -> bool {
        match self.execute("which", &[program]).await {
            Ok(out) => !out.trim().is_empty(),
            Err(_) => false,
        }
    }
}

/// [`Executor`] backed by `tokio::process::Command`.
#[derive(Debug, Default, Clone)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program = %program, args = ?args, "Executing command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ConnectorError::CommandUnavailable {
                program: program.to_string(),
                source: e,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            debug!(
                program = %program,
                status = ?output.status.code(),
                output = %combined.trim(),
                "Command failed"
            );
            return Err(ConnectorError::CommandFailed {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                status: output.status.code(),
                output: combined,
            });
        }

        trace!(program = %program, output = %combined, "Command succeeded");
        Ok(combined)
    }
}
