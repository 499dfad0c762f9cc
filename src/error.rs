//! Error types for node-cache.

use thiserror::Error;

/// Invalid startup configuration. Always fatal to startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid localip specified - {0}")]
    InvalidIp(String),

    #[error("Invalid port specified - {0}")]
    InvalidPort(String),

    #[error("Invalid sync interval: {0} (must be between 1 and 86400 seconds)")]
    InvalidInterval(u64),

    #[error("Invalid command timeout: {0} (must be between 1 and 3600 seconds)")]
    InvalidTimeout(u64),

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Failure while managing the dummy interface or its address.
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Failed to {op} local interface {name}: exit status {status}, output: {output}")]
    Command {
        op: &'static str,
        name: String,
        status: String,
        output: String,
    },

    #[error("Failed to execute {op} for interface {name}: {source}")]
    Exec {
        op: &'static str,
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Failure while checking, inserting or deleting one packet-filter rule.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("iptables {action} failed for rule {rule}: exit status {status}, output: {output}")]
    Command {
        action: &'static str,
        rule: String,
        status: String,
        output: String,
    },

    #[error("Failed to execute iptables {action} for rule {rule}: {source}")]
    Exec {
        action: &'static str,
        rule: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Rule {rule} still present after {attempts} removal attempts")]
    StillPresent { rule: String, attempts: usize },
}

/// Initial setup failed; the agent never reached the running state.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error(transparent)]
    Interface(#[from] InterfaceError),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// Render an optional exit code the way it is logged.
pub(crate) fn status_string(code: Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "terminated by signal".to_string(),
    }
}
