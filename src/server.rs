//! The DNS server the agent hands the process over to.
//!
//! Query serving, caching and forwarding all live in the server. The agent
//! only needs to start it, learn its configured port, wait for it, and stop
//! it on shutdown.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Contract with the embedded DNS server
#[async_trait]
pub trait DnsServer: Send {
    /// DNS port the server is configured with, if it has one
    fn configured_port(&self) -> Option<String>;

    /// Run until the server exits on its own.
    async fn run(&mut self) -> Result<ExitStatus>;

    /// Stop a running server. A no-op if it is not running.
    async fn stop(&mut self) -> Result<()>;
}

/// How long a stopping server gets between SIGTERM and SIGKILL
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Runs an external DNS server binary (CoreDNS by default) as a child
/// process.
pub struct ExternalServer {
    program: String,
    conf: Option<PathBuf>,
    dns_port: Option<String>,
    extra_args: Vec<String>,
    stop_grace: Duration,
    child: Option<Child>,
}

impl ExternalServer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            conf: None,
            dns_port: None,
            extra_args: Vec::new(),
            stop_grace: DEFAULT_STOP_GRACE,
            child: None,
        }
    }

    /// Server config file, passed as `-conf`
    pub fn with_conf(mut self, conf: Option<PathBuf>) -> Self {
        self.conf = conf;
        self
    }

    /// DNS port, passed as `-dns.port`
    pub fn with_dns_port(mut self, port: Option<String>) -> Self {
        self.dns_port = port;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    fn command_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(conf) = &self.conf {
            args.push("-conf".to_string());
            args.push(conf.display().to_string());
        }
        if let Some(port) = &self.dns_port {
            args.push("-dns.port".to_string());
            args.push(port.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn spawn(&self) -> Result<Child> {
        let args = self.command_args();
        info!("Starting DNS server: {} {}", self.program, args.join(" "));
        Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start DNS server {}", self.program))
    }

    /// SIGTERM the child so it can drain, SIGKILL it once the grace
    /// period runs out.
    async fn terminate(&self, child: &mut Child) -> Result<ExitStatus> {
        if let Some(pid) = child.id().and_then(|id| libc::pid_t::try_from(id).ok()) {
            // SAFETY: kill(2) takes no pointers; the pid belongs to a child
            // we have not reaped yet, so it cannot have been recycled
            if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
                warn!(
                    "Failed to send SIGTERM to DNS server: {}",
                    std::io::Error::last_os_error()
                );
            }
            match tokio::time::timeout(self.stop_grace, child.wait()).await {
                Ok(status) => {
                    return status
                        .with_context(|| format!("Failed to reap DNS server {}", self.program))
                }
                Err(_) => warn!(
                    "DNS server did not exit within {:?}, killing it",
                    self.stop_grace
                ),
            }
        }
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill DNS server: {}", e);
        }
        child
            .wait()
            .await
            .with_context(|| format!("Failed to reap DNS server {}", self.program))
    }
}

#[async_trait]
impl DnsServer for ExternalServer {
    fn configured_port(&self) -> Option<String> {
        self.dns_port.clone()
    }

    async fn run(&mut self) -> Result<ExitStatus> {
        if self.child.is_none() {
            let child = self.spawn()?;
            self.child = Some(child);
        }
        let Some(child) = self.child.as_mut() else {
            anyhow::bail!("DNS server {} is not running", self.program);
        };
        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for DNS server {}", self.program))?;
        self.child = None;
        debug!("DNS server exited with {}", status);
        Ok(status)
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = self.terminate(&mut child).await?;
        debug!("DNS server stopped with {}", status);
        Ok(())
    }
}
