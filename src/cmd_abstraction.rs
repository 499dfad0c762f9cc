//! Command execution abstraction for testability.
//!
//! Every mutation of the host (links, addresses, iptables rules) goes through
//! [`CommandExecutor`], so unit tests can swap in a mock or the in-memory
//! fake host instead of running real system commands.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::runtime::{Builder, Handle};

#[cfg(test)]
use mockall::automock;

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available
    pub code: Option<i32>,
}

impl CommandOutput {
    /// stdout and stderr joined, trimmed for log lines.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        out.push_str(self.stdout.trim_end());
        if !out.is_empty() && !self.stderr.trim().is_empty() {
            out.push('\n');
        }
        out.push_str(self.stderr.trim_end());
        out
    }
}

/// Trait for command execution, allowing dependency injection for testing.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command with the given arguments.
    ///
    /// A non-zero exit is reported through `CommandOutput::success`, not as
    /// an error. `Err` means the command could not be run to completion
    /// (spawn failure or timeout).
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Real implementation of CommandExecutor that runs actual system commands.
///
/// Each invocation is bounded by `timeout`; a child that outlives it is
/// killed and the call fails.
///
/// Calls block the current thread. Inside a tokio runtime they must come
/// from a blocking thread (`spawn_blocking`), never from an async task.
#[derive(Debug, Clone)]
pub struct RealCommandExecutor {
    timeout: Duration,
}

impl RealCommandExecutor {
    /// Default per-command timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a new RealCommandExecutor with the default timeout
    pub fn new() -> Self {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for RealCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a child to completion, killing it if it outlives `limit`.
async fn run_bounded(cmd: &str, args: &[String], limit: Duration) -> Result<CommandOutput> {
    let child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to execute {}", cmd))?;

    // dropping the timed-out future drops the child, which kills it
    let output = tokio::time::timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", cmd, limit))?
        .with_context(|| format!("Failed to wait for {}", cmd))?;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        success: output.status.success(),
        code: output.status.code(),
    })
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let run = run_bounded(cmd, args, self.timeout);
        match Handle::try_current() {
            Ok(handle) => handle.block_on(run),
            Err(_) => Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to build command runtime")?
                .block_on(run),
        }
    }
}

/// Helper function to convert a slice of &str to Vec<String>.
///
/// mockall has issues with lifetimes in `&[&str]`, so the trait takes
/// `&[String]` instead.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
