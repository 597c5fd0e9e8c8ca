//! Command Backend
//!
//! Drives `ipset` and `iptables` through `tokio::process`. Calls run one at a
//! time from the reconciler; `-w` makes iptables wait for the xtables lock
//! instead of failing when another tool holds it.

use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Rule, RuleSync, Table};
use crate::error::{QosError, Result};
use crate::types::ChainPolicy;

/// ipset error text for a group that does not exist
const MISSING_SET: &str = "does not exist";

/// Rule sync backed by the system `ipset` and `iptables` binaries
#[derive(Debug, Clone)]
pub struct CommandRuleSync {
    iptables: String,
    ipset: String,
}

impl CommandRuleSync {
    /// Check both binaries run; fails if either is unusable
    pub async fn init() -> Result<Self> {
        Self::with_binaries("iptables", "ipset").await
    }

    pub async fn with_binaries(iptables: &str, ipset: &str) -> Result<Self> {
        let backend = Self {
            iptables: iptables.to_string(),
            ipset: ipset.to_string(),
        };

        for (collaborator, program) in [("iptables", iptables), ("ipset", ipset)] {
            let output = Command::new(program)
                .arg("--version")
                .output()
                .await
                .map_err(|e| QosError::CollaboratorInit {
                    collaborator,
                    reason: format!("couldn't run {}: {}", program, e),
                })?;

            if !output.status.success() {
                return Err(QosError::CollaboratorInit {
                    collaborator,
                    reason: stderr_of(&output),
                });
            }

            info!(
                "🔧 {} available: {}",
                collaborator,
                String::from_utf8_lossy(&output.stdout).trim()
            );
        }

        Ok(backend)
    }

    async fn exec(&self, program: &str, args: &[String]) -> Result<Output> {
        debug!("{} {}", program, args.join(" "));
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| QosError::RuleMutation {
                command: command_line(program, args),
                reason: e.to_string(),
            })
    }

    /// Run and require success
    async fn run(&self, program: &str, args: Vec<String>) -> Result<Output> {
        let output = self.exec(program, &args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(QosError::RuleMutation {
                command: command_line(program, &args),
                reason: stderr_of(&output),
            })
        }
    }

    /// ipset call where a missing group counts as success
    async fn ipset_tolerant(&self, args: Vec<String>) -> Result<()> {
        let output = self.exec(&self.ipset, &args).await?;
        if output.status.success() || stderr_of(&output).contains(MISSING_SET) {
            return Ok(());
        }
        Err(QosError::RuleMutation {
            command: command_line(&self.ipset, &args),
            reason: stderr_of(&output),
        })
    }

    /// iptables call whose exit status answers a yes/no question
    async fn iptables_check(&self, args: Vec<String>) -> Result<bool> {
        let output = self.exec(&self.iptables, &args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(QosError::RuleMutation {
                command: command_line(&self.iptables, &args),
                reason: stderr_of(&output),
            }),
        }
    }

    fn iptables_args(table: Table, op: &str, chain: &str, extra: &[String]) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            table.as_str().to_string(),
            op.to_string(),
            chain.to_string(),
        ];
        args.extend_from_slice(extra);
        args
    }

    async fn rule_exists(&self, rule: &Rule) -> Result<bool> {
        self.iptables_check(Self::iptables_args(rule.table, "-C", &rule.chain, &rule.spec))
            .await
    }

    async fn chain_exists(&self, table: Table, chain: &str) -> Result<bool> {
        self.iptables_check(Self::iptables_args(table, "-n", "-L", &[chain.to_string()]))
            .await
    }

    /// Rules in a chain (`-S` output minus the chain declaration line)
    async fn chain_rule_count(&self, table: Table, chain: &str) -> Result<usize> {
        let output = self
            .run(&self.iptables, Self::iptables_args(table, "-S", chain, &[]))
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| line.starts_with("-A "))
            .count())
    }
}

#[async_trait]
impl RuleSync for CommandRuleSync {
    async fn ensure_group(&self, name: &str) -> Result<()> {
        self.run(&self.ipset, args(["create", name, "hash:ip", "-exist"]))
            .await
            .map(drop)
    }

    async fn flush_group(&self, name: &str) -> Result<()> {
        self.ipset_tolerant(args(["flush", name])).await
    }

    async fn destroy_group(&self, name: &str) -> Result<()> {
        self.ipset_tolerant(args(["destroy", name])).await
    }

    async fn add_member(&self, group: &str, addr: IpAddr) -> Result<()> {
        self.run(&self.ipset, args(["add", group, &addr.to_string(), "-exist"]))
            .await
            .map(drop)
    }

    async fn remove_member(&self, group: &str, addr: IpAddr) -> Result<()> {
        self.run(&self.ipset, args(["del", group, &addr.to_string(), "-exist"]))
            .await
            .map(drop)
    }

    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<()> {
        if table.is_builtin(chain) || self.chain_exists(table, chain).await? {
            return Ok(());
        }
        self.run(&self.iptables, Self::iptables_args(table, "-N", chain, &[]))
            .await
            .map(drop)
    }

    async fn append_rule(&self, rule: &Rule) -> Result<()> {
        if self.rule_exists(rule).await? {
            return Ok(());
        }
        self.run(
            &self.iptables,
            Self::iptables_args(rule.table, "-A", &rule.chain, &rule.spec),
        )
        .await
        .map(drop)
    }

    async fn insert_rule(&self, rule: &Rule, position: u32) -> Result<()> {
        if self.rule_exists(rule).await? {
            return Ok(());
        }
        let mut extra = vec![position.to_string()];
        extra.extend_from_slice(&rule.spec);
        self.run(
            &self.iptables,
            Self::iptables_args(rule.table, "-I", &rule.chain, &extra),
        )
        .await
        .map(drop)
    }

    async fn delete_rule(&self, rule: &Rule) -> Result<()> {
        if !self.chain_exists(rule.table, &rule.chain).await? || !self.rule_exists(rule).await? {
            return Ok(());
        }
        self.run(
            &self.iptables,
            Self::iptables_args(rule.table, "-D", &rule.chain, &rule.spec),
        )
        .await
        .map(drop)
    }

    async fn set_chain_policy(&self, table: Table, chain: &str, verdict: ChainPolicy) -> Result<()> {
        self.append_rule(&Rule::new(table, chain, ["-j", verdict.target()]))
            .await
    }

    async fn flush_chain(&self, table: Table, chain: &str) -> Result<()> {
        if !self.chain_exists(table, chain).await? {
            return Ok(());
        }
        self.run(&self.iptables, Self::iptables_args(table, "-F", chain, &[]))
            .await
            .map(drop)
    }

    async fn flush_and_delete_chain(&self, table: Table, chain: &str) -> Result<()> {
        if !self.chain_exists(table, chain).await? {
            return Ok(());
        }
        self.run(&self.iptables, Self::iptables_args(table, "-F", chain, &[]))
            .await?;
        self.run(&self.iptables, Self::iptables_args(table, "-X", chain, &[]))
            .await
            .map(drop)
    }

    async fn delete_chain_if_empty(&self, table: Table, chain: &str) -> Result<()> {
        if !self.chain_exists(table, chain).await? {
            return Ok(());
        }
        let rules = self.chain_rule_count(table, chain).await?;
        if rules > 0 {
            info!("Keeping {} chain {}: holds {} user rules", table, chain, rules);
            return Ok(());
        }
        self.run(&self.iptables, Self::iptables_args(table, "-X", chain, &[]))
            .await
            .map(drop)
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn command_line(program: &str, args: &[String]) -> String {
    format!("{} {}", program, args.join(" "))
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exit status {}", output.status)
    } else {
        stderr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iptables_args() {
        let args = CommandRuleSync::iptables_args(
            Table::Filter,
            "-I",
            "INPUT",
            &["1".to_string(), "-j".to_string(), "solana-tpu".to_string()],
        );
        assert_eq!(
            args.join(" "),
            "-w -t filter -I INPUT 1 -j solana-tpu"
        );
    }

    #[test]
    fn test_command_line() {
        assert_eq!(
            command_line("ipset", &args(["add", "solana-gossip", "1.2.3.4", "-exist"])),
            "ipset add solana-gossip 1.2.3.4 -exist"
        );
    }

    #[tokio::test]
    async fn test_init_fails_without_binaries() {
        let result =
            CommandRuleSync::with_binaries("/nonexistent/iptables", "/nonexistent/ipset").await;
        assert!(matches!(result, Err(QosError::CollaboratorInit { .. })));
    }
}
