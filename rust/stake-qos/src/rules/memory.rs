//! In-Memory Backend
//!
//! Keeps groups and chains in process memory. Used for `--dry-run`, where
//! every state change is logged instead of reaching the kernel, and as the
//! rule backend in tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use super::{Rule, RuleSync, Table};
use crate::error::{QosError, Result};
use crate::types::ChainPolicy;

#[derive(Debug, Default)]
struct MemoryState {
    groups: BTreeMap<String, BTreeSet<IpAddr>>,
    chains: BTreeMap<(Table, String), Vec<Vec<String>>>,
    /// Number of operations that changed state
    mutations: u64,
    /// Operations whose description contains one of these fail
    failures: Vec<String>,
}

/// Rule sync that never leaves the process
#[derive(Debug)]
pub struct MemoryRuleSync {
    state: Mutex<MemoryState>,
    log_mutations: bool,
}

impl Default for MemoryRuleSync {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuleSync {
    pub fn new() -> Self {
        let mut state = MemoryState::default();
        for table in [Table::Mangle, Table::Filter] {
            for chain in table.builtin_chains() {
                state.chains.insert((table, chain.to_string()), Vec::new());
            }
        }
        Self {
            state: Mutex::new(state),
            log_mutations: false,
        }
    }

    /// Dry-run flavour: logs each state change
    pub fn logging() -> Self {
        Self {
            log_mutations: true,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // State stays consistent even if a holder panicked mid-test
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `op` under the lock. `op` returns whether it changed anything.
    fn mutate<F>(&self, description: String, op: F) -> Result<()>
    where
        F: FnOnce(&mut MemoryState) -> std::result::Result<bool, String>,
    {
        let mut state = self.lock();

        if state.failures.iter().any(|p| description.contains(p.as_str())) {
            return Err(QosError::RuleMutation {
                command: description,
                reason: "injected failure".to_string(),
            });
        }

        match op(&mut *state) {
            Ok(true) => {
                state.mutations += 1;
                if self.log_mutations {
                    info!("[dry-run] #{} {}", state.mutations, description);
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(reason) => Err(QosError::RuleMutation {
                command: description,
                reason,
            }),
        }
    }
}

/// Inspection and failure injection for tests
#[cfg(test)]
impl MemoryRuleSync {
    /// Make every operation whose description contains `pattern` fail
    pub fn fail_on(&self, pattern: &str) {
        self.lock().failures.push(pattern.to_string());
    }

    pub fn mutations(&self) -> u64 {
        self.lock().mutations
    }

    pub fn group_exists(&self, name: &str) -> bool {
        self.lock().groups.contains_key(name)
    }

    pub fn members(&self, group: &str) -> Vec<IpAddr> {
        self.lock()
            .groups
            .get(group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, group: &str, addr: IpAddr) -> bool {
        self.lock()
            .groups
            .get(group)
            .is_some_and(|members| members.contains(&addr))
    }

    pub fn chain_exists(&self, table: Table, chain: &str) -> bool {
        self.lock().chains.contains_key(&(table, chain.to_string()))
    }

    /// Rules of a chain, each joined with spaces
    pub fn chain_rules(&self, table: Table, chain: &str) -> Vec<String> {
        self.lock()
            .chains
            .get(&(table, chain.to_string()))
            .map(|rules| rules.iter().map(|spec| spec.join(" ")).collect())
            .unwrap_or_default()
    }

    pub fn has_rule(&self, rule: &Rule) -> bool {
        self.lock()
            .chains
            .get(&(rule.table, rule.chain.clone()))
            .is_some_and(|rules| rules.contains(&rule.spec))
    }
}

/// Whether any rule matches on `group`
fn references_group(state: &MemoryState, group: &str) -> bool {
    state
        .chains
        .values()
        .flatten()
        .any(|spec| spec.windows(2).any(|pair| pair[0] == "--match-set" && pair[1] == group))
}

fn chain_key(table: Table, chain: &str) -> (Table, String) {
    (table, chain.to_string())
}

#[async_trait]
impl RuleSync for MemoryRuleSync {
    async fn ensure_group(&self, name: &str) -> Result<()> {
        self.mutate(format!("create group {}", name), |state| {
            if state.groups.contains_key(name) {
                return Ok(false);
            }
            state.groups.insert(name.to_string(), BTreeSet::new());
            Ok(true)
        })
    }

    async fn flush_group(&self, name: &str) -> Result<()> {
        self.mutate(format!("flush group {}", name), |state| {
            Ok(match state.groups.get_mut(name) {
                Some(members) if !members.is_empty() => {
                    members.clear();
                    true
                }
                _ => false,
            })
        })
    }

    async fn destroy_group(&self, name: &str) -> Result<()> {
        self.mutate(format!("destroy group {}", name), |state| {
            if state.groups.contains_key(name) && references_group(state, name) {
                return Err(format!("set {} is in use by a rule", name));
            }
            Ok(state.groups.remove(name).is_some())
        })
    }

    async fn add_member(&self, group: &str, addr: IpAddr) -> Result<()> {
        self.mutate(format!("add {} to group {}", addr, group), |state| {
            state
                .groups
                .get_mut(group)
                .map(|members| members.insert(addr))
                .ok_or_else(|| format!("group {} does not exist", group))
        })
    }

    async fn remove_member(&self, group: &str, addr: IpAddr) -> Result<()> {
        self.mutate(format!("remove {} from group {}", addr, group), |state| {
            state
                .groups
                .get_mut(group)
                .map(|members| members.remove(&addr))
                .ok_or_else(|| format!("group {} does not exist", group))
        })
    }

    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<()> {
        self.mutate(format!("create chain {} {}", table, chain), |state| {
            let key = chain_key(table, chain);
            if state.chains.contains_key(&key) {
                return Ok(false);
            }
            state.chains.insert(key, Vec::new());
            Ok(true)
        })
    }

    async fn append_rule(&self, rule: &Rule) -> Result<()> {
        self.mutate(format!("append {}", rule), |state| {
            let rules = state
                .chains
                .get_mut(&chain_key(rule.table, &rule.chain))
                .ok_or_else(|| format!("chain {} does not exist", rule.chain))?;
            if rules.contains(&rule.spec) {
                return Ok(false);
            }
            rules.push(rule.spec.clone());
            Ok(true)
        })
    }

    async fn insert_rule(&self, rule: &Rule, position: u32) -> Result<()> {
        self.mutate(format!("insert {} at {}", rule, position), |state| {
            let rules = state
                .chains
                .get_mut(&chain_key(rule.table, &rule.chain))
                .ok_or_else(|| format!("chain {} does not exist", rule.chain))?;
            if rules.contains(&rule.spec) {
                return Ok(false);
            }
            let index = (position.max(1) as usize - 1).min(rules.len());
            rules.insert(index, rule.spec.clone());
            Ok(true)
        })
    }

    async fn delete_rule(&self, rule: &Rule) -> Result<()> {
        self.mutate(format!("delete {}", rule), |state| {
            let Some(rules) = state.chains.get_mut(&chain_key(rule.table, &rule.chain)) else {
                return Ok(false);
            };
            match rules.iter().position(|spec| *spec == rule.spec) {
                Some(index) => {
                    rules.remove(index);
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    async fn set_chain_policy(&self, table: Table, chain: &str, verdict: ChainPolicy) -> Result<()> {
        self.append_rule(&Rule::new(table, chain, ["-j", verdict.target()]))
            .await
    }

    async fn flush_chain(&self, table: Table, chain: &str) -> Result<()> {
        self.mutate(format!("flush chain {} {}", table, chain), |state| {
            Ok(match state.chains.get_mut(&chain_key(table, chain)) {
                Some(rules) if !rules.is_empty() => {
                    rules.clear();
                    true
                }
                _ => false,
            })
        })
    }

    async fn flush_and_delete_chain(&self, table: Table, chain: &str) -> Result<()> {
        self.mutate(format!("flush and delete chain {} {}", table, chain), |state| {
            if table.is_builtin(chain) {
                return Err(format!("{} is a builtin chain", chain));
            }
            Ok(state.chains.remove(&chain_key(table, chain)).is_some())
        })
    }

    async fn delete_chain_if_empty(&self, table: Table, chain: &str) -> Result<()> {
        self.mutate(format!("delete empty chain {} {}", table, chain), |state| {
            let key = chain_key(table, chain);
            match state.chains.get(&key) {
                Some(rules) if rules.is_empty() && !table.is_builtin(chain) => {
                    state.chains.remove(&key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_group_operations_are_idempotent() {
        let rules = MemoryRuleSync::new();
        rules.ensure_group("g").await.unwrap();
        rules.ensure_group("g").await.unwrap();
        rules.add_member("g", ip("1.2.3.4")).await.unwrap();
        rules.add_member("g", ip("1.2.3.4")).await.unwrap();
        assert_eq!(rules.mutations(), 2);
        assert_eq!(rules.members("g"), vec![ip("1.2.3.4")]);

        rules.remove_member("g", ip("9.9.9.9")).await.unwrap();
        rules.destroy_group("g").await.unwrap();
        rules.destroy_group("g").await.unwrap();
        assert!(!rules.group_exists("g"));
    }

    #[tokio::test]
    async fn test_missing_group_is_error() {
        let rules = MemoryRuleSync::new();
        assert!(rules.add_member("nope", ip("1.2.3.4")).await.is_err());
    }

    #[tokio::test]
    async fn test_rule_operations() {
        let rules = MemoryRuleSync::new();
        rules.ensure_chain(Table::Filter, "c").await.unwrap();
        let a = Rule::new(Table::Filter, "c", ["-j", "A"]);
        let b = Rule::new(Table::Filter, "c", ["-j", "B"]);

        rules.append_rule(&a).await.unwrap();
        rules.append_rule(&a).await.unwrap();
        rules.insert_rule(&b, 1).await.unwrap();
        assert_eq!(rules.chain_rules(Table::Filter, "c"), vec!["-j B", "-j A"]);

        rules.delete_rule(&a).await.unwrap();
        rules.delete_rule(&a).await.unwrap();
        assert!(!rules.has_rule(&a));

        // Not empty yet
        rules.delete_chain_if_empty(Table::Filter, "c").await.unwrap();
        assert!(rules.chain_exists(Table::Filter, "c"));

        rules.flush_and_delete_chain(Table::Filter, "c").await.unwrap();
        assert!(!rules.chain_exists(Table::Filter, "c"));
        rules.flush_and_delete_chain(Table::Filter, "c").await.unwrap();
    }

    #[tokio::test]
    async fn test_append_to_missing_chain_fails() {
        let rules = MemoryRuleSync::new();
        let rule = Rule::new(Table::Filter, "absent", ["-j", "ACCEPT"]);
        assert!(rules.append_rule(&rule).await.is_err());
        // Deleting from a missing chain is fine
        assert!(rules.delete_rule(&rule).await.is_ok());
    }

    #[tokio::test]
    async fn test_referenced_group_cannot_be_destroyed() {
        let rules = MemoryRuleSync::new();
        rules.ensure_group("A").await.unwrap();
        rules.ensure_chain(Table::Mangle, "marks").await.unwrap();
        let mark = Rule::new(
            Table::Mangle,
            "marks",
            ["-m", "set", "--match-set", "A", "src", "-j", "MARK", "--set-mark", "1"],
        );
        rules.append_rule(&mark).await.unwrap();

        assert!(rules.destroy_group("A").await.is_err());
        assert!(rules.group_exists("A"));

        rules.delete_rule(&mark).await.unwrap();
        rules.destroy_group("A").await.unwrap();
        assert!(!rules.group_exists("A"));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let rules = MemoryRuleSync::new();
        rules.fail_on("create group bad");
        assert!(rules.ensure_group("bad").await.is_err());
        assert!(rules.ensure_group("good").await.is_ok());
    }
}
