//! Shutdown Coordination
//!
//! A signal listener flips a watch channel on the first SIGINT/SIGTERM. The
//! reconciler checks it between ticks and while sleeping, so a tick that is
//! already issuing mutations runs to completion. Once the loop has stopped,
//! [`ShutdownCoordinator::cleanup`] tears everything down.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::classes::ClassTable;
use crate::ports::ValidatorPorts;
use crate::rules::layout::{self, log_failure, PortChain, GOSSIP_GROUP, MANGLE_CHAIN};
use crate::rules::{RuleSync, Table};

/// Exit status after a signal-driven cleanup
pub const SHUTDOWN_EXIT_CODE: i32 = 1;

/// Sending half: fires once
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Receiving half, cloned into whoever needs to stop
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    /// Request shutdown. Returns false if it was already requested.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        })
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            // Trigger dropped without firing: nobody can stop us
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration`, returning early with true on shutdown
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        let woken = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.wait() => true,
        };
        woken || self.is_triggered()
    }
}

/// Wait for SIGINT or SIGTERM and fire the trigger.
///
/// The handlers stay installed afterwards, so later signals no longer kill
/// the process while cleanup runs.
pub async fn listen_for_signals(trigger: ShutdownTrigger) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    if trigger.trigger() {
        info!("🛑 Shutdown signal received, stopping after the current tick");
    }
    Ok(())
}

/// Outcome of a teardown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub steps: usize,
    pub failures: usize,
}

impl CleanupReport {
    fn record(&mut self, failures: usize) {
        self.steps += 1;
        self.failures += failures;
    }
}

/// Removes every group, chain and rule this service created
pub struct ShutdownCoordinator {
    rules: Arc<dyn RuleSync>,
    table: Arc<ClassTable>,
}

impl ShutdownCoordinator {
    pub fn new(rules: Arc<dyn RuleSync>, table: Arc<ClassTable>) -> Self {
        Self { rules, table }
    }

    fn groups(&self) -> impl Iterator<Item = &str> {
        std::iter::once(GOSSIP_GROUP).chain(self.table.names())
    }

    /// Best-effort teardown; a failed step is logged and the rest still run.
    ///
    /// Order: flush groups, port-keyed rules for `ports`, unkeyed jumps,
    /// owned chains, custom chains only when the operator left them empty,
    /// then destroy the groups.
    pub async fn cleanup(&self, ports: Option<ValidatorPorts>) -> CleanupReport {
        info!("🧹 Cleaning up and deleting all sets and firewall rules");

        let rules = self.rules.as_ref();
        let mut report = CleanupReport::default();

        for group in self.groups() {
            report.record(log_failure(rules.flush_group(group).await, &format!("flush {}", group)));
        }

        // Never installed if the local node was not found
        if let Some(ports) = ports {
            report.record(layout::remove_port_rules(rules, &ports).await);
        }

        report.record(
            log_failure(
                rules.delete_rule(&layout::passthrough_rule()).await,
                "prerouting passthrough",
            ),
        );
        for chain in PortChain::ALL {
            report.record(
                log_failure(
                    rules.delete_rule(&layout::filter_passthrough_rule(chain)).await,
                    &format!("input jump to {}", chain.filter_chain()),
                ),
            );
        }

        report.record(
            log_failure(
                rules.flush_and_delete_chain(Table::Mangle, MANGLE_CHAIN).await,
                MANGLE_CHAIN,
            ),
        );
        for chain in PortChain::ALL {
            report.record(
                log_failure(
                    rules
                        .flush_and_delete_chain(Table::Filter, chain.filter_chain())
                        .await,
                    chain.filter_chain(),
                ),
            );
        }

        for chain in PortChain::ALL {
            report.record(
                log_failure(
                    rules
                        .delete_chain_if_empty(Table::Filter, chain.custom_chain())
                        .await,
                    chain.custom_chain(),
                ),
            );
        }

        // Sets can only be destroyed once no mangle rule matches on them
        for group in self.groups() {
            report.record(log_failure(
                rules.destroy_group(group).await,
                &format!("destroy {}", group),
            ));
        }

        if report.failures > 0 {
            warn!(
                "Cleanup finished with {} failures over {} steps",
                report.failures, report.steps
            );
        } else {
            info!("Finished cleaning up ({} steps)", report.steps);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::layout::{install_base, install_port_rules, ChainPolicies};
    use crate::rules::{MemoryRuleSync, Rule};
    use crate::types::{ChainPolicy, TrafficClass};

    fn table() -> Arc<ClassTable> {
        Arc::new(
            ClassTable::build(
                vec![TrafficClass::new("A", 0.05, 1)],
                TrafficClass::new("unstaked", 0.0, 2),
            )
            .unwrap(),
        )
    }

    async fn installed(ports: Option<ValidatorPorts>) -> (Arc<MemoryRuleSync>, Arc<ClassTable>) {
        let rules = Arc::new(MemoryRuleSync::new());
        let table = table();
        let policies = ChainPolicies {
            vote: Some(ChainPolicy::Drop),
            ..Default::default()
        };
        install_base(rules.as_ref(), &table, &policies, true).await.unwrap();
        if let Some(ports) = ports {
            install_port_rules(rules.as_ref(), &ports).await;
        }
        rules
            .add_member("A", "1.2.3.4".parse().unwrap())
            .await
            .unwrap();
        (rules, table)
    }

    #[tokio::test]
    async fn test_trigger_fires_once() {
        let (trigger, signal) = channel();
        assert!(!signal.is_triggered());
        assert!(trigger.trigger());
        assert!(!trigger.trigger());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_trigger() {
        let (trigger, mut signal) = channel();
        let waiter = tokio::spawn(async move { signal.sleep(Duration::from_secs(3600)).await });
        trigger.trigger();
        let woke = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
    }

    #[tokio::test]
    async fn test_sleep_runs_out() {
        let (_trigger, mut signal) = channel();
        assert!(!signal.sleep(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_cleanup_removes_everything() {
        let ports = ValidatorPorts::from_tpu(8003);
        let (rules, table) = installed(Some(ports)).await;

        let coordinator = ShutdownCoordinator::new(rules.clone(), table);
        let report = coordinator.cleanup(Some(ports)).await;
        assert_eq!(report.failures, 0);

        for group in ["A", "unstaked", GOSSIP_GROUP] {
            assert!(!rules.group_exists(group));
        }
        assert!(rules.chain_rules(Table::Mangle, "PREROUTING").is_empty());
        assert!(rules.chain_rules(Table::Filter, "INPUT").is_empty());
        assert!(!rules.chain_exists(Table::Mangle, MANGLE_CHAIN));
        for chain in PortChain::ALL {
            assert!(!rules.chain_exists(Table::Filter, chain.filter_chain()));
            assert!(!rules.chain_exists(Table::Filter, chain.custom_chain()));
        }
    }

    #[tokio::test]
    async fn test_groups_outlive_mark_rules() {
        let (rules, table) = installed(None).await;
        rules.fail_on("flush and delete chain mangle solana-nodes");

        let report = ShutdownCoordinator::new(rules.clone(), table)
            .cleanup(None)
            .await;

        // The mark rules still match on the class groups
        assert_eq!(report.failures, 3);
        assert!(rules.group_exists("A"));
        assert!(rules.group_exists("unstaked"));
        assert!(rules.members("A").is_empty());
        assert!(!rules.group_exists(GOSSIP_GROUP));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_nonempty_custom_chain() {
        let (rules, table) = installed(None).await;
        rules
            .append_rule(&Rule::new(
                Table::Filter,
                "solana-tpu-custom",
                ["-s", "10.0.0.0/8", "-j", "ACCEPT"],
            ))
            .await
            .unwrap();

        ShutdownCoordinator::new(rules.clone(), table).cleanup(None).await;

        assert!(rules.chain_exists(Table::Filter, "solana-tpu-custom"));
        assert!(!rules.chain_exists(Table::Filter, "solana-tpu-custom-fwd"));
        assert!(!rules.chain_exists(Table::Filter, "solana-tpu"));
    }

    #[tokio::test]
    async fn test_cleanup_is_best_effort() {
        let ports = ValidatorPorts::from_tpu(8003);
        let (rules, table) = installed(Some(ports)).await;
        rules.fail_on("destroy group A");
        rules.fail_on("--dport 8004");

        let report = ShutdownCoordinator::new(rules.clone(), table)
            .cleanup(Some(ports))
            .await;

        assert_eq!(report.failures, 3);
        assert!(rules.group_exists("A"));
        assert!(!rules.group_exists("unstaked"));
        assert!(!rules.has_rule(&layout::mangle_port_rule(8003)));
        assert!(!rules.chain_exists(Table::Mangle, MANGLE_CHAIN));
    }
}
