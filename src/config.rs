//! Configuration management for node-cache.
//!
//! Values come from an optional YAML file and are overridden by command-line
//! flags. [`Settings::validate`] turns the raw values into immutable
//! [`Params`] that the rest of the agent works from.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Port used when neither the DNS server nor the settings name one
pub const DEFAULT_PORT: &str = "53";

/// Default name of the dummy interface
pub const DEFAULT_INTERFACE: &str = "nodelocaldns";

/// Default reconcile interval in seconds
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

/// Default per-command timeout in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Largest accepted reconcile interval (one day)
pub const MAX_SYNC_INTERVAL_SECS: u64 = 86_400;

/// Largest accepted per-command timeout (one hour)
pub const MAX_COMMAND_TIMEOUT_SECS: u64 = 3_600;

/// Raw configuration as read from file and flags
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Address the cache listens on and the dummy interface carries
    pub local_ip: String,

    /// Listen port; the DNS server's own configured port wins when present
    pub local_port: Option<String>,

    /// Name of the dummy interface to create
    pub interface_name: String,

    /// Seconds between rule reconciliation passes
    pub sync_interval: u64,

    /// Upper bound for a single ip/iptables invocation, in seconds
    pub command_timeout: u64,

    /// Start the DNS server even when interface/rule setup fails
    pub fail_open: bool,

    /// Path to the iptables binary
    pub iptables_path: String,

    /// Path to the ip binary
    pub ip_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_ip: String::new(),
            local_port: None,
            interface_name: DEFAULT_INTERFACE.to_string(),
            sync_interval: DEFAULT_SYNC_INTERVAL_SECS,
            command_timeout: DEFAULT_COMMAND_TIMEOUT_SECS,
            fail_open: false,
            iptables_path: "iptables".to_string(),
            ip_path: "ip".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Validate and freeze the settings.
    ///
    /// `server_port` is the DNS port configured on the embedded server, if
    /// it has one; it takes precedence over `local_port`.
    pub fn validate(&self, server_port: Option<&str>) -> Result<Params, ConfigError> {
        let local_ip: Ipv4Addr = self
            .local_ip
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidIp(self.local_ip.clone()))?;

        let local_port = server_port
            .or(self.local_port.as_deref())
            .unwrap_or(DEFAULT_PORT)
            .to_string();
        match local_port.parse::<u16>() {
            Ok(port) if port > 0 => {}
            _ => return Err(ConfigError::InvalidPort(local_port)),
        }

        if !(1..=MAX_SYNC_INTERVAL_SECS).contains(&self.sync_interval) {
            return Err(ConfigError::InvalidInterval(self.sync_interval));
        }
        if !(1..=MAX_COMMAND_TIMEOUT_SECS).contains(&self.command_timeout) {
            return Err(ConfigError::InvalidTimeout(self.command_timeout));
        }

        Ok(Params {
            local_ip,
            local_port,
            interface_name: self.interface_name.clone(),
            sync_interval: Duration::from_secs(self.sync_interval),
            command_timeout: Duration::from_secs(self.command_timeout),
            fail_open: self.fail_open,
            iptables_path: self.iptables_path.clone(),
            ip_path: self.ip_path.clone(),
        })
    }
}

/// Validated, immutable startup parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub local_ip: Ipv4Addr,
    /// Kept as given so it is substituted verbatim into rule arguments
    pub local_port: String,
    pub interface_name: String,
    pub sync_interval: Duration,
    pub command_timeout: Duration,
    pub fail_open: bool,
    pub iptables_path: String,
    pub ip_path: String,
}

#[cfg(test)]
impl Params {
    pub(crate) fn for_tests(ip: &str, port: &str) -> Self {
        Settings {
            local_ip: ip.to_string(),
            local_port: Some(port.to_string()),
            ..Settings::default()
        }
        .validate(None)
        .unwrap()
    }
}
