//! iptables backend implementation.

use std::sync::Arc;
use tracing::debug;

use super::PacketFilter;
use crate::catalog::Rule;
use crate::cmd_abstraction::{CommandExecutor, CommandOutput};
use crate::error::{status_string, RuleError};

/// `iptables -C` exit status meaning "no such rule"
const EXIT_RULE_ABSENT: i32 = 1;

/// IPv4 iptables driven through the `iptables` binary
pub struct Iptables {
    executor: Arc<dyn CommandExecutor>,
    path: String,
}

impl Iptables {
    pub fn new(executor: Arc<dyn CommandExecutor>, path: impl Into<String>) -> Self {
        Self {
            executor,
            path: path.into(),
        }
    }

    /// Build the argument list for one operation on a rule.
    ///
    /// `-w` waits for the xtables lock instead of failing when another
    /// process holds it.
    fn args(op: &str, rule: &Rule) -> Vec<String> {
        let mut args = Vec::with_capacity(rule.args.len() + 5);
        args.extend(
            ["-w", "-t", rule.table.as_str(), op, rule.chain.as_str()]
                .iter()
                .map(|s| s.to_string()),
        );
        args.extend(rule.args.iter().cloned());
        args
    }

    fn exec(&self, action: &'static str, op: &str, rule: &Rule) -> Result<CommandOutput, RuleError> {
        let args = Self::args(op, rule);
        debug!("{} {}", self.path, args.join(" "));
        self.executor
            .execute(&self.path, &args)
            .map_err(|source| RuleError::Exec {
                action,
                rule: rule.to_string(),
                source,
            })
    }

    fn command_error(action: &'static str, rule: &Rule, output: &CommandOutput) -> RuleError {
        RuleError::Command {
            action,
            rule: rule.to_string(),
            status: status_string(output.code),
            output: output.combined(),
        }
    }
}

impl PacketFilter for Iptables {
    fn check(&self, rule: &Rule) -> Result<bool, RuleError> {
        let output = self.exec("check", "-C", rule)?;
        match output.code {
            Some(0) => Ok(true),
            Some(EXIT_RULE_ABSENT) => Ok(false),
            _ => Err(Self::command_error("check", rule, &output)),
        }
    }

    fn insert_head(&self, rule: &Rule) -> Result<(), RuleError> {
        let output = self.exec("insert", "-I", rule)?;
        if !output.success {
            return Err(Self::command_error("insert", rule, &output));
        }
        Ok(())
    }

    fn delete(&self, rule: &Rule) -> Result<(), RuleError> {
        let output = self.exec("delete", "-D", rule)?;
        if !output.success {
            return Err(Self::command_error("delete", rule, &output));
        }
        Ok(())
    }
}
