//! CLI argument parsing with clap.
//!
//! Flag names follow the upstream node-cache binary (`-localip`,
//! `-intfname`, `-syncinterval`, `-dns.port`, `-conf`) so existing
//! manifests keep working with `--` prefixes.

use clap::Parser;
use std::path::PathBuf;

use crate::config::Settings;
use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[command(name = "node-cache")]
#[command(author, version, about = "Runs a DNS server as a node-local cache listening on the specified ip:port")]
pub struct Cli {
    /// IP address to bind the DNS cache to
    #[arg(long = "localip", env = "NODE_CACHE_LOCALIP")]
    pub local_ip: Option<String>,

    /// Name of the interface to be created
    #[arg(long = "intfname", env = "NODE_CACHE_INTFNAME")]
    pub interface_name: Option<String>,

    /// Interval (in seconds) to check for iptables rules
    #[arg(long = "syncinterval", env = "NODE_CACHE_SYNCINTERVAL")]
    pub sync_interval: Option<u64>,

    /// DNS port the server listens on (also used in the iptables rules)
    #[arg(long = "dns.port")]
    pub dns_port: Option<String>,

    /// DNS server configuration file (Corefile)
    #[arg(long = "conf")]
    pub conf: Option<PathBuf>,

    /// DNS server binary to run
    #[arg(long = "server-bin", default_value = "coredns", env = "NODE_CACHE_SERVER_BIN")]
    pub server_bin: String,

    /// Extra arguments passed to the DNS server
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    pub server_args: Vec<String>,

    /// Timeout (in seconds) for each ip/iptables invocation
    #[arg(long = "command-timeout")]
    pub command_timeout: Option<u64>,

    /// Keep serving DNS even if interface or rule setup fails
    #[arg(long = "fail-open")]
    pub fail_open: bool,

    /// Optional YAML config file; flags override its values
    #[arg(short, long, env = "NODE_CACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Load the config file, if any, and apply flag overrides on top.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        if let Some(ip) = &self.local_ip {
            settings.local_ip = ip.clone();
        }
        if let Some(name) = &self.interface_name {
            settings.interface_name = name.clone();
        }
        if let Some(interval) = self.sync_interval {
            settings.sync_interval = interval;
        }
        if let Some(timeout) = self.command_timeout {
            settings.command_timeout = timeout;
        }
        if self.fail_open {
            settings.fail_open = true;
        }
        Ok(settings)
    }
}
