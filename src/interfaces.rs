//! Dummy interface management.
//!
//! The cache listens on an address carried by a software-only `dummy`
//! link. The link and its single /32 address are created together and
//! removed together; deleting the link drops the address with it.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

use crate::cmd_abstraction::{args_to_strings, CommandExecutor, CommandOutput};
use crate::error::{status_string, InterfaceError};

/// Creates and destroys the listen interface through the `ip` tool
pub struct InterfaceManager {
    executor: Arc<dyn CommandExecutor>,
    ip_path: String,
}

impl InterfaceManager {
    pub fn new(executor: Arc<dyn CommandExecutor>, ip_path: impl Into<String>) -> Self {
        Self {
            executor,
            ip_path: ip_path.into(),
        }
    }

    /// Bring the interface to the requested state.
    ///
    /// With `present` the link is created if absent and `ip/32` is assigned
    /// to it. Without it the link is deleted, which fails when the link does
    /// not exist; callers tearing down treat that as non-fatal.
    pub fn ensure_interface(
        &self,
        name: &str,
        ip: Ipv4Addr,
        present: bool,
    ) -> Result<(), InterfaceError> {
        if !present {
            self.run("del", name, &["link", "del", name])?;
            debug!("Deleted interface {}", name);
            return Ok(());
        }

        if self.link_exists(name)? {
            debug!("Interface {} already exists", name);
        } else {
            self.run("add", name, &["link", "add", name, "type", "dummy"])?;
            debug!("Created dummy interface {}", name);
        }

        let addr = Ipv4Net::from(ip).to_string();
        if self.has_address(name, &addr)? {
            debug!("Address {} already assigned to {}", addr, name);
            return Ok(());
        }
        self.run("assign ip to", name, &["addr", "add", &addr, "dev", name])?;
        debug!("Assigned {} to {}", addr, name);
        Ok(())
    }

    /// Whether a link with this name exists
    pub fn link_exists(&self, name: &str) -> Result<bool, InterfaceError> {
        Ok(self.exec("show", name, &["link", "show", "dev", name])?.success)
    }

    fn has_address(&self, name: &str, cidr: &str) -> Result<bool, InterfaceError> {
        let output = self.run("show addresses of", name, &["-4", "addr", "show", "dev", name])?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix("inet "))
            .any(|rest| rest.split_whitespace().next() == Some(cidr)))
    }

    fn exec(&self, op: &'static str, name: &str, args: &[&str]) -> Result<CommandOutput, InterfaceError> {
        self.executor
            .execute(&self.ip_path, &args_to_strings(args))
            .map_err(|source| InterfaceError::Exec {
                op,
                name: name.to_string(),
                source,
            })
    }

    /// Run an `ip` command that must succeed
    fn run(&self, op: &'static str, name: &str, args: &[&str]) -> Result<CommandOutput, InterfaceError> {
        let output = self.exec(op, name, args)?;
        if !output.success {
            return Err(InterfaceError::Command {
                op,
                name: name.to_string(),
                status: status_string(output.code),
                output: output.combined(),
            });
        }
        Ok(output)
    }
}
