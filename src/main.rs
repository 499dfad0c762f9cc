//! node-cache - node-local DNS cache agent
//!
//! Sets up the listen interface and iptables rules, keeps them in place,
//! and runs the DNS server until it exits or the process is signalled.

use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use node_cache::cli::Cli;
use node_cache::cmd_abstraction::RealCommandExecutor;
use node_cache::enforcer::check_root;
use node_cache::lifecycle::{self, Agent, ServerExit};
use node_cache::server::{DnsServer, ExternalServer};
use node_cache::signal::ExitHooks;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging based on verbosity, RUST_LOG wins when set
    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = cli.settings()?;
    let server = ExternalServer::new(cli.server_bin.clone())
        .with_conf(cli.conf.clone())
        .with_dns_port(cli.dns_port.clone())
        .with_args(cli.server_args.clone());

    // Invalid configuration aborts before anything touches the host
    let params = settings.validate(server.configured_port().as_deref())?;
    check_root()?;

    let executor = Arc::new(RealCommandExecutor::with_timeout(params.command_timeout));
    let agent = Arc::new(Agent::new(params, executor));

    let code = match lifecycle::run(agent, server, ExitHooks::new()).await? {
        ServerExit::Exited(status) => status
            .code()
            .and_then(|code| u8::try_from(code).ok())
            .map(ExitCode::from)
            .unwrap_or(ExitCode::FAILURE),
        ServerExit::Signalled(_) => ExitCode::SUCCESS,
    };
    Ok(code)
}
