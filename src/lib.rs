//! # node-cache - node-local DNS cache agent
//!
//! Gives a DNS cache a stable local address on every node and keeps the
//! packet-filter plumbing for it in place.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        node-cache                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap) + Settings (serde_yaml)                         │
//! │    └── validated into immutable Params                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Lifecycle (Agent)                                          │
//! │    ├── teardown -> setup on start                           │
//! │    ├── Reconciler: periodic re-assertion of the catalog     │
//! │    └── exit hook: teardown exactly once                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  InterfaceManager (ip)    │  RuleEnforcer (iptables)        │
//! │    dummy link + /32       │    8 NOTRACK/ACCEPT rules       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CommandExecutor (bounded tokio::process, mockable)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DnsServer (CoreDNS child process)                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use node_cache::cmd_abstraction::RealCommandExecutor;
//! use node_cache::config::Settings;
//! use node_cache::lifecycle::{self, Agent};
//! use node_cache::server::ExternalServer;
//! use node_cache::signal::ExitHooks;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings {
//!         local_ip: "169.254.20.10".to_string(),
//!         ..Settings::default()
//!     };
//!     let params = settings.validate(None)?;
//!     let executor = Arc::new(RealCommandExecutor::with_timeout(params.command_timeout));
//!     let agent = Arc::new(Agent::new(params, executor));
//!
//!     let server = ExternalServer::new("coredns");
//!     lifecycle::run(agent, server, ExitHooks::new()).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`catalog`] - The fixed rule set for one listen address
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - Command execution with timeouts, mockable
//! - [`config`] - Settings file, validation into `Params`
//! - [`enforcer`] - Idempotent iptables rule operations
//! - [`error`] - Error types
//! - [`interfaces`] - Dummy interface management
//! - [`lifecycle`] - Startup, running state and teardown
//! - [`reconcile`] - Periodic self-healing of rules
//! - [`server`] - The embedded DNS server process
//! - [`signal`] - Signals, exit hooks, shutdown channel

pub mod catalog;
pub mod cli;
pub mod cmd_abstraction;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod interfaces;
pub mod lifecycle;
pub mod reconcile;
pub mod server;
pub mod signal;

pub use cli::Cli;
pub use config::{Params, Settings};
pub use lifecycle::Agent;
