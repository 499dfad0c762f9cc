//! The fixed set of packet-filter rules for one listen address.

use std::fmt;

use crate::config::Params;

/// iptables table a rule lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Raw,
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Raw => "raw",
            Table::Filter => "filter",
        }
    }
}

/// Built-in chain a rule is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Prerouting,
    Input,
    Output,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Input => "INPUT",
            Chain::Output => "OUTPUT",
        }
    }
}

/// A single rule. Identity is structural: two rules with the same table,
/// chain and arguments are the same rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub table: Table,
    pub chain: Chain,
    pub args: Vec<String>,
}

impl Rule {
    pub fn new(table: Table, chain: Chain, args: &[&str]) -> Self {
        Self {
            table,
            chain,
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} {} {}",
            self.table.as_str(),
            self.chain.as_str(),
            self.args.join(" ")
        )
    }
}

/// Build the rule catalog: NOTRACK + ACCEPT for tcp and udp, for traffic to
/// the local address and for replies from it.
pub fn build_rules(params: &Params) -> Vec<Rule> {
    let ip = params.local_ip.to_string();
    let port = params.local_port.as_str();
    let ip = ip.as_str();

    let mut rules = Vec::with_capacity(8);

    // packets destined to the local cache
    for (table, chain, target) in [
        (Table::Raw, Chain::Prerouting, "NOTRACK"),
        (Table::Filter, Chain::Input, "ACCEPT"),
    ] {
        for proto in ["tcp", "udp"] {
            rules.push(Rule::new(
                table,
                chain,
                &["-p", proto, "-d", ip, "--dport", port, "-j", target],
            ));
        }
    }

    // replies from the local cache
    for (table, target) in [(Table::Raw, "NOTRACK"), (Table::Filter, "ACCEPT")] {
        for proto in ["tcp", "udp"] {
            rules.push(Rule::new(
                table,
                Chain::Output,
                &["-p", proto, "-s", ip, "--sport", port, "-j", target],
            ));
        }
    }

    rules
}
