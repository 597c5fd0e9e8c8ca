//! Reconciler
//!
//! The control loop. Each tick:
//!
//! 1. fetch vote accounts and cluster nodes (a failure retries the tick
//!    after a short backoff, with no mutations issued);
//! 2. build the stake ledger;
//! 3. walk the nodes in order: the local node drives the port tracker,
//!    every other node is classified;
//! 4. place each address once, in the highest class any node sharing it
//!    earned;
//! 5. optionally reap addresses that left gossip;
//! 6. log a summary and sleep until the next tick or shutdown.
//!
//! Every mutation is idempotent, so an unchanged cluster produces no net
//! change on the next tick.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::Metrics;
use crate::classes::ClassTable;
use crate::classifier::{self, Placement};
use crate::config::QosConfig;
use crate::error::Result;
use crate::ledger::StakeLedger;
use crate::membership::AddressBook;
use crate::ports::{PortIntent, PortTracker};
use crate::rpc::ClusterRpc;
use crate::rules::layout;
use crate::rules::RuleSync;
use crate::shutdown::ShutdownSignal;
use crate::types::{ClusterNode, Identity};

/// Loop parameters fixed at construction
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Local validator identity; `None` disables port tracking
    pub identity: Option<Identity>,

    /// Classify peers every tick
    pub update_groups: bool,

    pub tick_interval: Duration,

    pub fetch_retry: Duration,

    /// Ticks an address may be absent before it is reaped; 0 disables
    pub reap_after_ticks: u64,
}

impl ReconcilerSettings {
    pub fn from_config(config: &QosConfig, identity: Option<Identity>, update_groups: bool) -> Self {
        Self {
            identity,
            update_groups,
            tick_interval: config.tick_interval(),
            fetch_retry: config.fetch_retry(),
            reap_after_ticks: config.reap_after_ticks,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub nodes_seen: usize,
    pub classified: usize,
    pub skipped: usize,
    pub rule_failures: usize,
    pub port_changed: bool,
    pub reaped: usize,
}

pub struct Reconciler {
    rpc: Arc<dyn ClusterRpc>,
    rules: Arc<dyn RuleSync>,
    table: Arc<ClassTable>,
    settings: ReconcilerSettings,
    tracker: PortTracker,
    book: AddressBook,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        rpc: Arc<dyn ClusterRpc>,
        rules: Arc<dyn RuleSync>,
        table: Arc<ClassTable>,
        settings: ReconcilerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            rpc,
            rules,
            table,
            settings,
            tracker: PortTracker::new(),
            book: AddressBook::new(),
            metrics,
        }
    }

    /// Run ticks until shutdown; hands back the port tracker so cleanup
    /// knows which port rules are installed.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> PortTracker {
        info!(
            "🔁 Reconciler started: tick every {}s, grouping updates {}",
            self.settings.tick_interval.as_secs(),
            if self.settings.update_groups { "on" } else { "off" }
        );

        while !shutdown.is_triggered() {
            let wait = match self.tick().await {
                Ok(summary) => {
                    info!(
                        "📊 Updated groups: {} nodes visible in gossip, {} classified, {} skipped, {} reaped, {} rule failures{}",
                        summary.nodes_seen,
                        summary.classified,
                        summary.skipped,
                        summary.reaped,
                        summary.rule_failures,
                        if summary.port_changed { ", validator ports updated" } else { "" }
                    );
                    self.settings.tick_interval
                }
                Err(e) => {
                    self.metrics.inc_fetch_failures();
                    warn!(
                        "{}; retrying in {}s",
                        e,
                        self.settings.fetch_retry.as_secs()
                    );
                    self.settings.fetch_retry
                }
            };

            if shutdown.sleep(wait).await {
                break;
            }
        }

        info!("Reconciler stopped");
        self.tracker
    }

    /// One reconciliation pass. Only fetch failures are returned; everything
    /// else is logged and counted in the summary.
    pub async fn tick(&mut self) -> Result<TickSummary> {
        let (ledger, nodes) = if self.settings.update_groups {
            let accounts = self.rpc.fetch_vote_accounts().await?;
            let nodes = self.rpc.fetch_cluster_nodes().await?;
            let ledger = StakeLedger::build(&accounts, self.settings.identity.as_ref());
            (Some(ledger), nodes)
        } else {
            (None, self.rpc.fetch_cluster_nodes().await?)
        };

        self.book.advance();

        let mut summary = TickSummary {
            nodes_seen: nodes.len(),
            ..Default::default()
        };

        let table = Arc::clone(&self.table);
        let mut plan = BTreeMap::new();

        for node in &nodes {
            if self.is_local(node) {
                self.track_local_ports(node, &mut summary).await;
                continue;
            }

            if let Some(ledger) = &ledger {
                plan_node(node, ledger, &table, &mut plan, &mut summary);
            }
        }

        for (addr, placement) in &plan {
            summary.rule_failures +=
                layout::apply_placement(self.rules.as_ref(), *addr, placement).await;
            self.book.touch(*addr);
        }

        if ledger.is_some() && self.settings.reap_after_ticks > 0 {
            self.reap(&mut summary).await;
        }

        self.metrics.add_rule_failures(summary.rule_failures);
        self.metrics
            .record_tick(summary.nodes_seen, summary.classified, summary.skipped);

        Ok(summary)
    }

    fn is_local(&self, node: &ClusterNode) -> bool {
        self.settings.identity.as_ref() == Some(&node.identity)
    }

    async fn track_local_ports(&mut self, node: &ClusterNode, summary: &mut TickSummary) {
        let Some(tpu) = node.tpu_address.as_deref() else {
            debug!("Local node {} advertises no tpu address", node.identity.short());
            return;
        };

        let transition = match self.tracker.observe(tpu, node.tpu_quic_address.as_deref()) {
            Ok(transition) => transition,
            Err(e) => {
                warn!("Couldn't load validator ports for {}: {}", node.identity, e);
                return;
            }
        };

        let intents = transition.intents();
        if intents.is_empty() {
            return;
        }

        for intent in intents {
            match intent {
                PortIntent::Teardown(old) => {
                    info!("TPU port changed from {}, removing old port rules", old.tpu);
                    summary.rule_failures +=
                        layout::remove_port_rules(self.rules.as_ref(), &old).await;
                }
                PortIntent::Install(ports) => {
                    summary.rule_failures +=
                        layout::install_port_rules(self.rules.as_ref(), &ports).await;
                    info!(
                        "Validator ports set, identity={} tpu={} tpufwd={} vote={} quic={} quicfwd={}",
                        node.identity,
                        ports.tpu,
                        ports.tpu_forward,
                        ports.tpu_vote,
                        ports.tpu_quic,
                        ports.tpu_quic_forward
                    );
                }
            }
        }

        summary.port_changed = true;
        self.metrics.inc_port_changes();
        self.metrics.set_ports(self.tracker.current());
    }

    async fn reap(&mut self, summary: &mut TickSummary) {
        let stale = self.book.reap(self.settings.reap_after_ticks);
        if stale.is_empty() {
            return;
        }

        for addr in &stale {
            summary.rule_failures +=
                layout::forget_address(self.rules.as_ref(), &self.table, *addr).await;
        }

        info!("🧹 Reaped {} addresses no longer in gossip", stale.len());
        summary.reaped = stale.len();
        self.metrics.add_reaped(stale.len());
    }
}

/// Classify one node into `plan`. An address shared by several nodes keeps
/// the highest class among them.
fn plan_node<'t>(
    node: &ClusterNode,
    ledger: &StakeLedger,
    table: &'t ClassTable,
    plan: &mut BTreeMap<IpAddr, Placement<'t>>,
    summary: &mut TickSummary,
) {
    let addresses = match classifier::peer_addresses(node) {
        Ok(Some(addresses)) => addresses,
        Ok(None) => {
            debug!("No IPv4 gossip address: {}", node.identity);
            summary.skipped += 1;
            return;
        }
        Err(e) => {
            warn!("Skipping node {}: {}", node.identity, e);
            summary.skipped += 1;
            return;
        }
    };

    let placement = classifier::place(ledger.fraction_of(&node.identity), table);

    for addr in addresses {
        match plan.entry(addr) {
            Entry::Vacant(slot) => {
                slot.insert(placement.clone());
            }
            Entry::Occupied(mut slot) => {
                if table.rank(placement.target) < table.rank(slot.get().target) {
                    debug!("{} shared by {}, moving up to {}", addr, node.identity, placement.target);
                    slot.insert(placement.clone());
                }
            }
        }
    }

    summary.classified += 1;
}
