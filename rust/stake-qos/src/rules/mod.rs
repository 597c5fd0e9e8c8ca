//! Rule Sync Module
//!
//! Abstraction over the kernel packet classification state: address groups
//! (ipsets) and chains/rules (iptables).
//!
//! ## Contract
//!
//! Every operation is idempotent. Adding a member that is already present,
//! deleting a rule that is gone or destroying a missing group all succeed,
//! which is what lets the reconciler repeat a whole tick without tracking
//! what it changed last time.

mod command;
pub mod layout;
mod memory;

pub use command::CommandRuleSync;
pub use memory::MemoryRuleSync;

use async_trait::async_trait;
use std::fmt;
use std::net::IpAddr;

use crate::error::Result;
use crate::types::ChainPolicy;

/// iptables table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Mangle,
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Mangle => "mangle",
            Table::Filter => "filter",
        }
    }

    /// Chains the kernel provides and that can never be removed
    pub fn builtin_chains(&self) -> &'static [&'static str] {
        match self {
            Table::Mangle => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
            Table::Filter => &["INPUT", "FORWARD", "OUTPUT"],
        }
    }

    pub fn is_builtin(&self, chain: &str) -> bool {
        self.builtin_chains().contains(&chain)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rule: table, chain and match/target arguments
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    pub spec: Vec<String>,
}

impl Rule {
    pub fn new<I, S>(table: Table, chain: &str, spec: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table,
            chain: chain.to_string(),
            spec: spec.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.spec.join(" "))
    }
}

/// Packet classification backend
#[async_trait]
pub trait RuleSync: Send + Sync {
    /// Create an address group if missing
    async fn ensure_group(&self, name: &str) -> Result<()>;

    /// Remove every member of a group
    async fn flush_group(&self, name: &str) -> Result<()>;

    /// Remove a group; missing groups are fine
    async fn destroy_group(&self, name: &str) -> Result<()>;

    async fn add_member(&self, group: &str, addr: IpAddr) -> Result<()>;

    async fn remove_member(&self, group: &str, addr: IpAddr) -> Result<()>;

    /// Create a user chain if missing
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<()>;

    /// Append a rule unless an identical one exists
    async fn append_rule(&self, rule: &Rule) -> Result<()>;

    /// Insert a rule at `position` (1-based) unless an identical one exists
    async fn insert_rule(&self, rule: &Rule, position: u32) -> Result<()>;

    /// Delete a rule if present
    async fn delete_rule(&self, rule: &Rule) -> Result<()>;

    /// Terminate a user chain with `-j <verdict>`
    async fn set_chain_policy(&self, table: Table, chain: &str, verdict: ChainPolicy) -> Result<()>;

    /// Remove every rule from a chain, keeping the chain
    async fn flush_chain(&self, table: Table, chain: &str) -> Result<()>;

    /// Flush and remove a chain if it exists
    async fn flush_and_delete_chain(&self, table: Table, chain: &str) -> Result<()>;

    /// Remove a chain only when it holds no rules
    async fn delete_chain_if_empty(&self, table: Table, chain: &str) -> Result<()>;
}
