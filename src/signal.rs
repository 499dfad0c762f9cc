//! Signal handling and shutdown coordination.
//!
//! - [`wait_for_termination`] resolves on SIGINT or SIGTERM.
//! - [`ExitHooks`] holds the callbacks that must run once before the
//!   process exits, whichever path gets there first.
//! - [`shutdown_channel`] is the single-slot cancellation signal for the
//!   reconcile task.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Termination signal that was received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Interrupt,
    Terminate,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Interrupt => f.write_str("SIGINT"),
            Termination::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for SIGINT or SIGTERM.
///
/// If no handler can be registered (restricted environments) this never
/// resolves, and shutdown is left to the DNS server exiting.
pub async fn wait_for_termination() -> Termination {
    let sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to register SIGINT handler: {}", e);
            None
        }
    };
    let sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            None
        }
    };

    let received = match (sigint, sigterm) {
        (Some(mut int), Some(mut term)) => {
            tokio::select! {
                _ = int.recv() => Termination::Interrupt,
                _ = term.recv() => Termination::Terminate,
            }
        }
        (Some(mut int), None) => {
            int.recv().await;
            Termination::Interrupt
        }
        (None, Some(mut term)) => {
            term.recv().await;
            Termination::Terminate
        }
        (None, None) => {
            warn!("No signal handlers registered - graceful shutdown disabled");
            std::future::pending().await
        }
    };
    info!("Received {}, initiating graceful shutdown...", received);
    received
}

type Hook = Box<dyn FnOnce() + Send>;

/// Callbacks run exactly once before process exit.
#[derive(Clone, Default)]
pub struct ExitHooks {
    hooks: Arc<Mutex<Vec<Hook>>>,
    fired: Arc<AtomicBool>,
}

impl ExitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Registering after the hooks fired is a no-op.
    pub fn register<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.has_fired() {
            warn!("Exit hook registered after shutdown, ignoring");
            return;
        }
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.push(Box::new(hook));
        }
    }

    /// Run all registered hooks in registration order. Only the first call
    /// does anything; returns whether this call ran them.
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let hooks = match self.hooks.lock() {
            Ok(mut hooks) => std::mem::take(&mut *hooks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for hook in hooks {
            hook();
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Sending half of the reconcile task's cancellation signal
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: mpsc::Sender<()>,
}

impl ShutdownSignal {
    /// Deliver the cancellation notice without blocking.
    ///
    /// Returns `false` if a notice is already pending or nobody listens
    /// any more.
    pub fn notify(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Single-slot cancellation channel
pub fn shutdown_channel() -> (ShutdownSignal, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (ShutdownSignal { tx }, rx)
}
