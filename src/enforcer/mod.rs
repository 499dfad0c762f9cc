//! Rule enforcement against the host packet filter.
//!
//! [`PacketFilter`] is the raw check/insert/delete surface of a backend;
//! [`RuleEnforcer`] builds the idempotent operations the agent relies on.

mod iptables;

use tracing::debug;

pub use iptables::Iptables;

use crate::catalog::Rule;
use crate::error::RuleError;

#[cfg(test)]
use mockall::automock;

/// Upper bound on delete/re-check rounds when purging one rule.
pub const MAX_PURGE_ROUNDS: usize = 32;

/// Trait for packet-filter backends
#[cfg_attr(test, automock)]
pub trait PacketFilter: Send + Sync {
    /// Whether the rule is currently installed
    fn check(&self, rule: &Rule) -> Result<bool, RuleError>;

    /// Insert the rule at the head of its chain
    fn insert_head(&self, rule: &Rule) -> Result<(), RuleError>;

    /// Delete one instance of the rule
    fn delete(&self, rule: &Rule) -> Result<(), RuleError>;
}

/// Result of re-asserting one rule
#[derive(Debug)]
pub struct ReconcileOutcome<'a> {
    pub rule: &'a Rule,
    /// `Ok(true)` if the rule was already installed, `Ok(false)` if it was
    /// missing and has been inserted.
    pub result: Result<bool, RuleError>,
}

impl ReconcileOutcome<'_> {
    pub fn restored(&self) -> bool {
        matches!(self.result, Ok(false))
    }
}

/// Idempotent rule operations on top of a [`PacketFilter`]
pub struct RuleEnforcer {
    filter: Box<dyn PacketFilter>,
}

impl RuleEnforcer {
    pub fn new(filter: Box<dyn PacketFilter>) -> Self {
        Self { filter }
    }

    /// Insert the rule at the head of its chain unless it is already there.
    /// Returns whether it existed before the call.
    pub fn ensure_present(&self, rule: &Rule) -> Result<bool, RuleError> {
        if self.filter.check(rule)? {
            return Ok(true);
        }
        self.filter.insert_head(rule)?;
        Ok(false)
    }

    /// Remove the rule if installed; a no-op otherwise.
    pub fn ensure_absent(&self, rule: &Rule) -> Result<(), RuleError> {
        if !self.filter.check(rule)? {
            return Ok(());
        }
        self.filter.delete(rule)
    }

    /// Re-assert every rule in order. A failure on one rule does not stop
    /// the others from being attempted.
    pub fn reconcile_all<'a>(&self, rules: &'a [Rule]) -> Vec<ReconcileOutcome<'a>> {
        rules
            .iter()
            .map(|rule| ReconcileOutcome {
                rule,
                result: self.ensure_present(rule),
            })
            .collect()
    }

    /// Remove every stacked instance of a rule.
    ///
    /// Deletes, then re-checks with `ensure_present`, which re-inserts the
    /// rule when it was gone. When that reports the rule was absent, the
    /// instance it just created is deleted and the rule is known to be gone.
    /// A prior crashed run may have left duplicates, hence the loop; it is
    /// capped at [`MAX_PURGE_ROUNDS`].
    pub fn purge(&self, rule: &Rule) -> Result<(), RuleError> {
        for round in 1..=MAX_PURGE_ROUNDS {
            if let Err(e) = self.ensure_absent(rule) {
                debug!("Delete of {} failed in round {}: {}", rule, round, e);
            }
            match self.ensure_present(rule) {
                Ok(true) => continue,
                Ok(false) => return self.ensure_absent(rule),
                Err(e) => {
                    // the failed check may still have left an instance behind
                    if let Err(cleanup) = self.ensure_absent(rule) {
                        debug!("Cleanup delete of {} failed: {}", rule, cleanup);
                    }
                    return Err(e);
                }
            }
        }
        Err(RuleError::StillPresent {
            rule: rule.to_string(),
            attempts: MAX_PURGE_ROUNDS,
        })
    }
}

/// Check if running as root (effective UID == 0)
///
/// Creating links and editing iptables needs CAP_NET_ADMIN; UID 0 is the
/// common way to have it.
pub fn check_root() -> anyhow::Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "node-cache requires root privileges to manage interfaces and iptables rules.\n\
             Alternatively, ensure the process has the CAP_NET_ADMIN capability."
        )
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_rules;
    use crate::cmd_abstraction::fake::FakeHost;
    use crate::config::Params;
    use std::sync::Arc;

    fn setup() -> (Arc<FakeHost>, RuleEnforcer, Vec<Rule>) {
        let host = Arc::new(FakeHost::new());
        let enforcer = RuleEnforcer::new(Box::new(Iptables::new(host.clone(), "iptables")));
        let rules = build_rules(&Params::for_tests("169.254.20.10", "53"));
        (host, enforcer, rules)
    }

    #[test]
    fn test_ensure_present_is_idempotent() {
        let (host, enforcer, rules) = setup();
        assert!(!enforcer.ensure_present(&rules[0]).unwrap());
        assert!(enforcer.ensure_present(&rules[0]).unwrap());
        assert_eq!(host.count_of(&rules[0]), 1);
        assert_eq!(host.rule_count(), 1);
    }

    #[test]
    fn test_ensure_absent_on_absent_rule_is_noop() {
        let (host, enforcer, rules) = setup();
        enforcer.ensure_absent(&rules[2]).unwrap();
        assert_eq!(host.rule_count(), 0);
        assert!(!host.calls().iter().any(|c| c.contains(" -D ")));
    }

    #[test]
    fn test_ensure_absent_removes_rule() {
        let (host, enforcer, rules) = setup();
        host.add_rule(&rules[1]);
        enforcer.ensure_absent(&rules[1]).unwrap();
        assert_eq!(host.count_of(&rules[1]), 0);
    }

    #[test]
    fn test_reconcile_all_reports_existing_and_inserted() {
        let (host, enforcer, rules) = setup();
        host.add_rule(&rules[4]);

        let outcomes = enforcer.reconcile_all(&rules);
        assert_eq!(outcomes.len(), rules.len());
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.rule, &rules[i]);
            assert_eq!(*outcome.result.as_ref().unwrap(), i == 4);
        }
        assert_eq!(host.rule_count(), rules.len());
    }

    #[test]
    fn test_reconcile_all_continues_after_failure() {
        let (host, enforcer, rules) = setup();
        host.fail_when("-I INPUT -p tcp");

        let outcomes = enforcer.reconcile_all(&rules);
        let failed: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].rule, &rules[2]);
        assert_eq!(outcomes.iter().filter(|o| o.restored()).count(), 7);
        assert_eq!(host.rule_count(), 7);
    }

    #[test]
    fn test_reconcile_restores_only_missing_rule() {
        let (host, enforcer, rules) = setup();
        enforcer.reconcile_all(&rules);
        host.remove_rule(&rules[5]);

        let outcomes = enforcer.reconcile_all(&rules);
        let restored: Vec<_> = outcomes.iter().filter(|o| o.restored()).collect();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].rule, &rules[5]);
        for rule in &rules {
            assert_eq!(host.count_of(rule), 1);
        }
    }

    #[test]
    fn test_purge_removes_stacked_duplicates() {
        let (host, enforcer, rules) = setup();
        for _ in 0..3 {
            host.add_rule(&rules[0]);
        }
        host.add_rule(&rules[1]);

        enforcer.purge(&rules[0]).unwrap();
        assert_eq!(host.count_of(&rules[0]), 0);
        assert_eq!(host.count_of(&rules[1]), 1);
    }

    #[test]
    fn test_purge_absent_rule_is_noop() {
        let (host, enforcer, rules) = setup();
        enforcer.purge(&rules[3]).unwrap();
        assert_eq!(host.rule_count(), 0);
    }

    #[test]
    fn test_purge_gives_up_after_cap() {
        let mut filter = MockPacketFilter::new();
        // a backend that claims the rule never goes away
        filter.expect_check().returning(|_| Ok(true));
        filter.expect_delete().returning(|_| Ok(()));
        filter.expect_insert_head().never();

        let enforcer = RuleEnforcer::new(Box::new(filter));
        let rules = build_rules(&Params::for_tests("169.254.20.10", "53"));
        let err = enforcer.purge(&rules[0]).unwrap_err();
        assert!(matches!(
            err,
            RuleError::StillPresent { attempts: MAX_PURGE_ROUNDS, .. }
        ));
    }

    #[test]
    fn test_purge_check_failure_is_reported() {
        let (host, enforcer, rules) = setup();
        host.fail_when("-C OUTPUT");
        let outbound = rules.iter().find(|r| r.chain == crate::catalog::Chain::Output).unwrap();
        assert!(enforcer.purge(outbound).is_err());
        assert_eq!(host.rule_count(), 0);
    }

    #[test]
    fn test_purge_keeps_check_error_when_cleanup_fails() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut filter = MockPacketFilter::new();
        // first check (delete pass) succeeds, every later check fails
        filter.expect_check().returning(move |rule| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Ok(false);
            }
            Err(RuleError::Command {
                action: if n == 1 { "check" } else { "cleanup" },
                rule: rule.to_string(),
                status: "4".to_string(),
                output: "xtables lock".to_string(),
            })
        });
        filter.expect_insert_head().never();
        filter.expect_delete().never();

        let enforcer = RuleEnforcer::new(Box::new(filter));
        let rules = build_rules(&Params::for_tests("169.254.20.10", "53"));
        let err = enforcer.purge(&rules[0]).unwrap_err();
        assert!(matches!(err, RuleError::Command { action: "check", .. }));
        // delete pass, failed re-check, cleanup attempt
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
