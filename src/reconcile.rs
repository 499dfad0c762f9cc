//! Periodic rule reconciliation.
//!
//! Rules deleted behind the agent's back are re-inserted on every tick
//! until the shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::catalog::Rule;
use crate::enforcer::RuleEnforcer;

/// Counts from one reconcile pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub restored: usize,
    pub failed: usize,
}

/// Re-assert every rule once, logging each rule that had gone missing and
/// each failure.
pub fn reconcile_once(enforcer: &RuleEnforcer, rules: &[Rule]) -> TickSummary {
    let mut summary = TickSummary::default();
    for outcome in enforcer.reconcile_all(rules) {
        match outcome.result {
            Ok(true) => {}
            Ok(false) => {
                info!("Added back nonexistent rule - {}", outcome.rule);
                summary.restored += 1;
            }
            Err(e) => {
                error!("Failed to check rule {} - {}", outcome.rule, e);
                summary.failed += 1;
            }
        }
    }
    summary
}

/// Background task that keeps the rule catalog installed
pub struct Reconciler {
    enforcer: Arc<RuleEnforcer>,
    rules: Arc<[Rule]>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(enforcer: Arc<RuleEnforcer>, rules: Arc<[Rule]>, interval: Duration) -> Self {
        Self {
            enforcer,
            rules,
            interval,
        }
    }

    /// Start ticking. The first pass runs one interval after the start.
    ///
    /// The task ends on the first shutdown notice, or when every sender is
    /// gone.
    pub fn spawn(self, mut shutdown: mpsc::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + self.interval, self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("Exiting iptables check loop");
                        return;
                    }
                    _ = tick.tick() => {
                        let enforcer = self.enforcer.clone();
                        let rules = self.rules.clone();
                        match tokio::task::spawn_blocking(move || reconcile_once(&enforcer, &rules)).await {
                            Ok(summary) => debug!(
                                "Rule check done: {} restored, {} failed",
                                summary.restored, summary.failed
                            ),
                            Err(e) => error!("Rule check task failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}
