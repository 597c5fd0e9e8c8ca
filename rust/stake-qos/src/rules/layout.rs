//! Rule Layout
//!
//! Names of the chains and groups this service owns and the rules that tie
//! them together.
//!
//! ```text
//! mangle PREROUTING ──udp dport∈ports──► solana-nodes ── match-set <class> ──► MARK <fwmark>
//!                                                      └─► ACCEPT
//! filter INPUT ──udp dport=tpu/quic──► solana-tpu ──► solana-tpu-custom, then verdict
//!              ──udp dport=fwd──────► solana-tpu-fwd ──► solana-tpu-custom-fwd, then verdict
//!              ──udp dport=vote─────► solana-tpu-vote ──► solana-tpu-custom-vote, then verdict
//! ```

use std::net::IpAddr;
use tracing::{info, warn};

use super::{Rule, RuleSync, Table};
use crate::classes::ClassTable;
use crate::classifier::Placement;
use crate::error::Result;
use crate::ports::ValidatorPorts;
use crate::types::{ChainPolicy, TrafficClass};

/// Mangle chain holding the per-class MARK rules
pub const MANGLE_CHAIN: &str = "solana-nodes";

/// Group of every address visible in gossip
pub const GOSSIP_GROUP: &str = "solana-gossip";

/// Builtin chain feeding the mangle chain
pub const PREROUTING: &str = "PREROUTING";

/// Builtin chain feeding the filter chains
pub const INPUT: &str = "INPUT";

/// Default verdicts of the three filter chains; `None` falls through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainPolicies {
    pub tpu: Option<ChainPolicy>,
    pub fwd: Option<ChainPolicy>,
    pub vote: Option<ChainPolicy>,
}

/// The three port-keyed filter chains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChain {
    Tpu,
    Forward,
    Vote,
}

impl PortChain {
    pub const ALL: [PortChain; 3] = [PortChain::Tpu, PortChain::Forward, PortChain::Vote];

    pub fn filter_chain(&self) -> &'static str {
        match self {
            PortChain::Tpu => "solana-tpu",
            PortChain::Forward => "solana-tpu-fwd",
            PortChain::Vote => "solana-tpu-vote",
        }
    }

    /// User-managed chain consulted before the verdict
    pub fn custom_chain(&self) -> &'static str {
        match self {
            PortChain::Tpu => "solana-tpu-custom",
            PortChain::Forward => "solana-tpu-custom-fwd",
            PortChain::Vote => "solana-tpu-custom-vote",
        }
    }

    pub fn policy(&self, policies: &ChainPolicies) -> Option<ChainPolicy> {
        match self {
            PortChain::Tpu => policies.tpu,
            PortChain::Forward => policies.fwd,
            PortChain::Vote => policies.vote,
        }
    }
}

/// Which filter chain each validator port feeds
pub fn port_assignments(ports: &ValidatorPorts) -> [(u16, PortChain); 5] {
    [
        (ports.tpu, PortChain::Tpu),
        (ports.tpu_quic, PortChain::Tpu),
        (ports.tpu_forward, PortChain::Forward),
        (ports.tpu_quic_forward, PortChain::Forward),
        (ports.tpu_vote, PortChain::Vote),
    ]
}

// =============================================================================
// RULES
// =============================================================================

pub fn class_mark_rule(class: &TrafficClass) -> Rule {
    Rule::new(
        Table::Mangle,
        MANGLE_CHAIN,
        vec![
            "-m".to_string(),
            "set".to_string(),
            "--match-set".to_string(),
            class.name.clone(),
            "src".to_string(),
            "-j".to_string(),
            "MARK".to_string(),
            "--set-mark".to_string(),
            class.fwmark.to_string(),
        ],
    )
}

/// Send all UDP through the mangle chain (no local identity)
pub fn passthrough_rule() -> Rule {
    Rule::new(Table::Mangle, PREROUTING, ["-p", "udp", "-j", MANGLE_CHAIN])
}

/// Unkeyed INPUT jump to a filter chain; never installed, removed on teardown
pub fn filter_passthrough_rule(chain: PortChain) -> Rule {
    Rule::new(Table::Filter, INPUT, ["-p", "udp", "-j", chain.filter_chain()])
}

pub fn custom_jump_rule(chain: PortChain) -> Rule {
    Rule::new(Table::Filter, chain.filter_chain(), ["-j", chain.custom_chain()])
}

pub fn mangle_port_rule(port: u16) -> Rule {
    Rule::new(
        Table::Mangle,
        PREROUTING,
        vec![
            "-p".to_string(),
            "udp".to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-j".to_string(),
            MANGLE_CHAIN.to_string(),
        ],
    )
}

pub fn filter_port_rule(port: u16, chain: PortChain) -> Rule {
    Rule::new(
        Table::Filter,
        INPUT,
        vec![
            "-p".to_string(),
            "udp".to_string(),
            "--dport".to_string(),
            port.to_string(),
            "-j".to_string(),
            chain.filter_chain().to_string(),
        ],
    )
}

// =============================================================================
// INSTALLATION
// =============================================================================

/// Create groups, chains and unkeyed rules at startup.
///
/// Group and chain creation failures are returned; the caller treats them
/// as fatal. Individual rule failures are logged and counted.
pub async fn install_base(
    rules: &dyn RuleSync,
    table: &ClassTable,
    policies: &ChainPolicies,
    passthrough: bool,
) -> Result<usize> {
    // Groups start empty every run
    for group in std::iter::once(GOSSIP_GROUP).chain(table.names()) {
        rules.ensure_group(group).await?;
        rules.flush_group(group).await?;
    }

    // Owned chains are rebuilt from scratch; custom chains belong to the operator
    rules.ensure_chain(Table::Mangle, MANGLE_CHAIN).await?;
    rules.flush_chain(Table::Mangle, MANGLE_CHAIN).await?;
    for chain in PortChain::ALL {
        rules.ensure_chain(Table::Filter, chain.filter_chain()).await?;
        rules.flush_chain(Table::Filter, chain.filter_chain()).await?;
        rules.ensure_chain(Table::Filter, chain.custom_chain()).await?;
    }

    let mut failures = 0;

    // MARK rules must precede the terminal ACCEPT
    for class in table.classes() {
        failures += log_failure(
            rules.append_rule(&class_mark_rule(class)).await,
            &format!("mark rule for class {}", class.name),
        );
    }
    failures += log_failure(
        rules
            .set_chain_policy(Table::Mangle, MANGLE_CHAIN, ChainPolicy::Accept)
            .await,
        "mangle chain policy",
    );

    for chain in PortChain::ALL {
        if let Some(policy) = chain.policy(policies) {
            failures += log_failure(
                rules
                    .set_chain_policy(Table::Filter, chain.filter_chain(), policy)
                    .await,
                &format!("policy {} on {}", policy, chain.filter_chain()),
            );
        }
        failures += log_failure(
            rules.insert_rule(&custom_jump_rule(chain), 1).await,
            &format!("custom chain jump {}", chain.custom_chain()),
        );
    }

    if passthrough {
        info!("No local identity: sending all UDP traffic through {}", MANGLE_CHAIN);
        failures += log_failure(
            rules.append_rule(&passthrough_rule()).await,
            "prerouting passthrough",
        );
    }

    info!(
        "🧱 Base rules installed: {} classes, {} failures",
        table.len(),
        failures
    );

    Ok(failures)
}

/// Hook the validator ports into the mangle and filter chains
pub async fn install_port_rules(rules: &dyn RuleSync, ports: &ValidatorPorts) -> usize {
    let mut failures = 0;
    for (port, chain) in port_assignments(ports) {
        failures += log_failure(
            rules.append_rule(&mangle_port_rule(port)).await,
            &format!("mangle rule for port {}", port),
        );
        failures += log_failure(
            rules.insert_rule(&filter_port_rule(port, chain), 1).await,
            &format!("filter rule for port {}", port),
        );
    }
    failures
}

pub async fn remove_port_rules(rules: &dyn RuleSync, ports: &ValidatorPorts) -> usize {
    let mut failures = 0;
    for (port, chain) in port_assignments(ports) {
        failures += log_failure(
            rules.delete_rule(&mangle_port_rule(port)).await,
            &format!("removing mangle rule for port {}", port),
        );
        failures += log_failure(
            rules.delete_rule(&filter_port_rule(port, chain)).await,
            &format!("removing filter rule for port {}", port),
        );
    }
    failures
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Put one address where `placement` says.
///
/// Evictions run before the add so the address never sits in two classes.
pub async fn apply_placement(rules: &dyn RuleSync, addr: IpAddr, placement: &Placement<'_>) -> usize {
    let mut failures = log_failure(
        rules.add_member(GOSSIP_GROUP, addr).await,
        &format!("adding {} to {}", addr, GOSSIP_GROUP),
    );

    for class in &placement.evict {
        failures += log_failure(
            rules.remove_member(class, addr).await,
            &format!("removing {} from class {}", addr, class),
        );
    }

    failures += log_failure(
        rules.add_member(placement.target, addr).await,
        &format!("adding {} to class {}", addr, placement.target),
    );

    failures
}

/// Drop an address from every group
pub async fn forget_address(rules: &dyn RuleSync, table: &ClassTable, addr: IpAddr) -> usize {
    let mut failures = 0;
    for group in table.names().chain(std::iter::once(GOSSIP_GROUP)) {
        failures += log_failure(
            rules.remove_member(group, addr).await,
            &format!("removing {} from {}", addr, group),
        );
    }
    failures
}

/// Log a failed mutation; returns 1 on failure so callers can count
pub fn log_failure(result: Result<()>, context: &str) -> usize {
    match result {
        Ok(()) => 0,
        Err(e) => {
            warn!("Rule sync failed ({}): {}", context, e);
            1
        }
    }
}
