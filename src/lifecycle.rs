//! Agent lifecycle: startup, steady state and teardown.
//!
//! ```text
//! Uninitialized -> Initializing -> Running -> ShuttingDown -> Stopped
//! ```
//!
//! A freshly built agent is `Uninitialized`; [`Agent::start`] moves it to
//! `Initializing`, and it stays there if setup fails.
//!
//! Startup always tears down first so state left by a crashed previous
//! instance is cleared before setup. Teardown runs once, from whichever
//! exit path is taken first.

use std::future::Future;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::{build_rules, Rule};
use crate::cmd_abstraction::CommandExecutor;
use crate::config::{Params, Settings};
use crate::enforcer::{Iptables, RuleEnforcer};
use crate::error::{ConfigError, SetupError};
use crate::interfaces::InterfaceManager;
use crate::reconcile::Reconciler;
use crate::server::DnsServer;
use crate::signal::{self, shutdown_channel, ExitHooks, ShutdownSignal, Termination};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// How the agent's run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// The DNS server exited on its own
    Exited(ExitStatus),
    /// A termination signal arrived and the server was stopped
    Signalled(Termination),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The node-local cache agent
pub struct Agent {
    params: Params,
    rules: Arc<[Rule]>,
    enforcer: Arc<RuleEnforcer>,
    interfaces: InterfaceManager,
    state: Mutex<LifecycleState>,
    shutdown: Mutex<Option<ShutdownSignal>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl Agent {
    /// Build the agent and its rule catalog from validated parameters.
    pub fn new(params: Params, executor: Arc<dyn CommandExecutor>) -> Self {
        let enforcer = RuleEnforcer::new(Box::new(Iptables::new(
            executor.clone(),
            params.iptables_path.clone(),
        )));
        let interfaces = InterfaceManager::new(executor, params.ip_path.clone());
        Self {
            rules: build_rules(&params).into(),
            params,
            enforcer: Arc::new(enforcer),
            interfaces,
            state: Mutex::new(LifecycleState::Uninitialized),
            shutdown: Mutex::new(None),
            reconciler: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Validate settings and build the agent. Nothing touches the host
    /// if validation fails.
    pub fn from_settings(
        settings: &Settings,
        server_port: Option<&str>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<Self, ConfigError> {
        let params = settings.validate(server_port)?;
        Ok(Self::new(params, executor))
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    fn transition(&self, to: LifecycleState) {
        let mut state = lock(&self.state);
        debug!("Lifecycle {:?} -> {:?}", *state, to);
        *state = to;
    }

    /// Create the interface and install every rule. Stops at the first
    /// failure.
    pub fn setup(&self) -> Result<(), SetupError> {
        self.interfaces.ensure_interface(
            &self.params.interface_name,
            self.params.local_ip,
            true,
        )?;
        for rule in self.rules.iter() {
            self.enforcer.ensure_present(rule)?;
        }
        info!(
            "Interface {} up with {}/32, {} rules installed",
            self.params.interface_name,
            self.params.local_ip,
            self.rules.len()
        );
        Ok(())
    }

    /// Remove the interface and every rule, attempting every step even after
    /// a failure. Returns the number of steps that failed.
    pub fn remove_all(&self) -> usize {
        info!("Tearing down");
        let mut failures = 0;
        let name = &self.params.interface_name;

        match self.interfaces.link_exists(name) {
            Ok(false) => debug!("Interface {} not present", name),
            _ => {
                if let Err(e) = self
                    .interfaces
                    .ensure_interface(name, self.params.local_ip, false)
                {
                    error!("Ignoring error during teardown - {}", e);
                    failures += 1;
                }
            }
        }

        for rule in self.rules.iter() {
            if let Err(e) = self.enforcer.purge(rule) {
                error!("Ignoring error during teardown - {}", e);
                failures += 1;
            }
        }
        failures
    }

    /// Clear leftovers from a previous instance, then set up.
    pub fn start(&self) -> Result<(), SetupError> {
        self.transition(LifecycleState::Initializing);
        let failures = self.remove_all();
        if failures > 0 {
            debug!("Pre-setup teardown had {} failed steps", failures);
        }
        self.setup()
    }

    /// Spawn the reconcile task and enter the running state. Must be called
    /// inside a tokio runtime.
    pub fn start_reconciler(&self) {
        let (signal, rx) = shutdown_channel();
        let handle = Reconciler::new(
            self.enforcer.clone(),
            self.rules.clone(),
            self.params.sync_interval,
        )
        .spawn(rx);
        *lock(&self.shutdown) = Some(signal);
        *lock(&self.reconciler) = Some(handle);
        self.transition(LifecycleState::Running);
    }

    /// Signal the reconcile task and hand back its handle so the caller
    /// can wait for it.
    pub fn stop_reconciler(&self) -> Option<JoinHandle<()>> {
        if let Some(signal) = lock(&self.shutdown).as_ref() {
            signal.notify();
        }
        lock(&self.reconciler).take()
    }

    /// Final teardown. Only the first call has any effect.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            debug!("Teardown already done");
            return;
        }
        self.transition(LifecycleState::ShuttingDown);
        if let Some(signal) = lock(&self.shutdown).as_ref() {
            // single-slot channel, never blocks
            signal.notify();
        }
        self.remove_all();
        self.transition(LifecycleState::Stopped);
    }
}

async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

/// Run the agent until SIGINT/SIGTERM or until the DNS server exits.
pub async fn run<S: DnsServer>(agent: Arc<Agent>, server: S, hooks: ExitHooks) -> anyhow::Result<ServerExit> {
    run_until(agent, server, hooks, signal::wait_for_termination()).await
}

/// [`run`] with the termination trigger supplied by the caller.
pub async fn run_until<S, F>(
    agent: Arc<Agent>,
    mut server: S,
    hooks: ExitHooks,
    terminate: F,
) -> anyhow::Result<ServerExit>
where
    S: DnsServer,
    F: Future<Output = Termination>,
{
    let starter = agent.clone();
    if let Err(e) = blocking(move || starter.start()).await? {
        error!("Failed to setup - {}, Exiting", e);
        if !agent.params().fail_open {
            let stopper = agent.clone();
            blocking(move || stopper.teardown()).await?;
            return Err(e.into());
        }
        warn!("fail_open is set, starting DNS server without local interface plumbing");
    }

    agent.start_reconciler();
    let hook_agent = agent.clone();
    hooks.register(move || hook_agent.teardown());

    let outcome = tokio::select! {
        result = server.run() => Err(result),
        sig = terminate => Ok(sig),
    };

    if let Some(handle) = agent.stop_reconciler() {
        if let Err(e) = handle.await {
            warn!("Reconcile task ended abnormally: {}", e);
        }
    }

    match outcome {
        Err(result) => {
            // the server returned without a signal we trapped
            warn!("Untrapped signal, tearing down");
            let firing = hooks.clone();
            blocking(move || firing.fire()).await?;
            Ok(ServerExit::Exited(result?))
        }
        Ok(sig) => {
            let firing = hooks.clone();
            blocking(move || firing.fire()).await?;
            if let Err(e) = server.stop().await {
                error!("Failed to stop DNS server: {}", e);
            }
            Ok(ServerExit::Signalled(sig))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd_abstraction::fake::FakeHost;
    use async_trait::async_trait;
    use std::os::unix::process::ExitStatusExt;

    fn params() -> Params {
        Settings {
            local_ip: "169.254.20.10".to_string(),
            local_port: Some("53".to_string()),
            sync_interval: 5,
            ..Settings::default()
        }
        .validate(None)
        .unwrap()
    }

    fn agent_with(params: Params) -> (Arc<FakeHost>, Arc<Agent>) {
        let host = Arc::new(FakeHost::new());
        let agent = Arc::new(Agent::new(params, host.clone()));
        (host, agent)
    }

    /// Server whose `run` exits with `exit_code`, or never returns when it
    /// is `None`.
    struct FakeServer {
        exit_code: Option<i32>,
        ran: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    impl FakeServer {
        fn new(exit_code: Option<i32>) -> Self {
            Self {
                exit_code,
                ran: Arc::new(AtomicBool::new(false)),
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl DnsServer for FakeServer {
        fn configured_port(&self) -> Option<String> {
            None
        }

        async fn run(&mut self) -> anyhow::Result<ExitStatus> {
            self.ran.store(true, Ordering::SeqCst);
            match self.exit_code {
                Some(code) => Ok(ExitStatus::from_raw(code << 8)),
                None => std::future::pending().await,
            }
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_new_agent_is_uninitialized() {
        let (host, agent) = agent_with(params());
        assert_eq!(agent.state(), LifecycleState::Uninitialized);
        assert_eq!(agent.rules().len(), 8);
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_start_enters_initializing() {
        let (host, agent) = agent_with(params());
        host.fail_when("-I OUTPUT");
        assert_eq!(agent.state(), LifecycleState::Uninitialized);

        assert!(agent.start().is_err());
        assert_eq!(agent.state(), LifecycleState::Initializing);
    }

    #[test]
    fn test_invalid_ip_touches_nothing() {
        let host = Arc::new(FakeHost::new());
        let settings = Settings {
            local_ip: "not-an-ip".to_string(),
            ..Settings::default()
        };
        let err = Agent::from_settings(&settings, None, host.clone()).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidIp(_)));
        assert!(host.calls().is_empty());
        assert!(!host.has_link("nodelocaldns"));
    }

    #[test]
    fn test_setup_then_teardown_round_trip() {
        let (host, agent) = agent_with(params());
        agent.start().unwrap();

        assert!(host.has_link("nodelocaldns"));
        assert_eq!(host.addresses("nodelocaldns"), vec!["169.254.20.10/32".to_string()]);
        assert_eq!(host.rule_count(), 8);

        agent.teardown();
        assert!(!host.has_link("nodelocaldns"));
        assert_eq!(host.rule_count(), 0);
        assert_eq!(agent.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_start_clears_previous_instance() {
        let (host, agent) = agent_with(params());
        // a crashed run left the link and stacked duplicates behind
        agent.setup().unwrap();
        host.add_rule(&agent.rules()[0]);
        host.add_rule(&agent.rules()[0]);
        assert_eq!(host.rule_count(), 10);

        agent.start().unwrap();
        assert_eq!(host.rule_count(), 8);
        for rule in agent.rules() {
            assert_eq!(host.count_of(rule), 1);
        }
        assert_eq!(host.addresses("nodelocaldns").len(), 1);
    }

    #[test]
    fn test_interface_failure_aborts_setup() {
        let (host, agent) = agent_with(params());
        host.fail_when("link add");

        let err = agent.start().unwrap_err();
        assert!(matches!(err, SetupError::Interface(_)));
        assert_eq!(host.rule_count(), 0);
        assert_eq!(agent.state(), LifecycleState::Initializing);
    }

    #[test]
    fn test_rule_failure_is_fail_fast() {
        let (host, agent) = agent_with(params());
        host.fail_when("-I INPUT");

        let err = agent.start().unwrap_err();
        assert!(matches!(err, SetupError::Rule(_)));
        // the two PREROUTING rules went in before the failure, nothing after
        assert_eq!(host.rule_count(), 2);
    }

    #[test]
    fn test_teardown_runs_once() {
        let (host, agent) = agent_with(params());
        agent.start().unwrap();
        agent.teardown();
        let calls = host.calls().len();

        agent.teardown();
        assert_eq!(host.calls().len(), calls);
    }

    #[test]
    fn test_teardown_continues_after_errors() {
        let (host, agent) = agent_with(params());
        agent.start().unwrap();
        host.fail_when("-D PREROUTING");
        host.fail_when("link del");

        let failures = agent.remove_all();
        assert!(failures >= 3);
        // everything not blocked by an injected failure is gone
        for rule in agent.rules().iter().filter(|r| r.chain != crate::catalog::Chain::Prerouting) {
            assert_eq!(host.count_of(rule), 0);
        }
    }

    #[test]
    fn test_teardown_on_clean_host() {
        let (host, agent) = agent_with(params());
        assert_eq!(agent.remove_all(), 0);
        assert_eq!(host.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_run_server_exit_tears_down() {
        let (host, agent) = agent_with(params());
        let server = FakeServer::new(Some(0));
        let ran = server.ran.clone();
        let hooks = ExitHooks::new();

        let exit = run_until(agent.clone(), server, hooks.clone(), std::future::pending())
            .await
            .unwrap();

        assert!(matches!(exit, ServerExit::Exited(status) if status.success()));
        assert!(ran.load(Ordering::SeqCst));
        assert!(hooks.has_fired());
        assert_eq!(agent.state(), LifecycleState::Stopped);
        assert_eq!(host.rule_count(), 0);
        assert!(!host.has_link("nodelocaldns"));
    }

    #[tokio::test]
    async fn test_run_signal_stops_server_and_tears_down() {
        let (host, agent) = agent_with(params());
        let server = FakeServer::new(None);
        let stopped = server.stopped.clone();
        let hooks = ExitHooks::new();

        let exit = run_until(agent.clone(), server, hooks.clone(), async {
            Termination::Terminate
        })
        .await
        .unwrap();

        assert_eq!(exit, ServerExit::Signalled(Termination::Terminate));
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(host.rule_count(), 0);
        assert_eq!(agent.state(), LifecycleState::Stopped);
        // a second exit path does not tear down again
        assert!(!hooks.fire());
    }

    #[tokio::test]
    async fn test_run_setup_failure_fails_closed() {
        let (host, agent) = agent_with(params());
        host.fail_when("-I OUTPUT");
        let server = FakeServer::new(Some(0));
        let ran = server.ran.clone();

        let result = run_until(agent.clone(), server, ExitHooks::new(), std::future::pending()).await;

        assert!(result.is_err());
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(agent.state(), LifecycleState::Stopped);
        // partial setup was rolled back
        assert_eq!(host.rule_count(), 0);
        assert!(!host.has_link("nodelocaldns"));
    }

    #[tokio::test]
    async fn test_run_setup_failure_fail_open() {
        let mut p = params();
        p.fail_open = true;
        let (host, agent) = agent_with(p);
        host.fail_when("link add");
        let server = FakeServer::new(Some(0));
        let ran = server.ran.clone();

        let exit = run_until(agent, server, ExitHooks::new(), std::future::pending())
            .await
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
        assert!(matches!(exit, ServerExit::Exited(_)));
        assert_eq!(host.rule_count(), 0);
    }
}
