//! Stake Ledger
//!
//! Per-tick map from peer identity to activated stake, built from the
//! current and delinquent vote account lists.

use std::collections::HashMap;
use tracing::debug;

use crate::types::{Identity, VoteAccount, VoteAccounts};

/// Stake by identity plus the network total
#[derive(Debug, Clone, Default)]
pub struct StakeLedger {
    stakes: HashMap<Identity, u64>,
    total_stake: u64,
}

impl StakeLedger {
    /// Build the ledger for one tick.
    ///
    /// Every account counts towards the total. Only peers with positive
    /// stake that are not `local` get an entry; when an identity shows up in
    /// both lists the delinquent record wins.
    pub fn build(accounts: &VoteAccounts, local: Option<&Identity>) -> Self {
        let mut ledger = Self::default();

        for account in accounts.current.iter().chain(accounts.delinquent.iter()) {
            ledger.record(account, local);
        }

        debug!(
            "Stake ledger: {} staked peers, total stake {}",
            ledger.stakes.len(),
            ledger.total_stake
        );

        ledger
    }

    fn record(&mut self, account: &VoteAccount, local: Option<&Identity>) {
        self.total_stake = self.total_stake.saturating_add(account.activated_stake);

        if local == Some(&account.node_pubkey) || account.activated_stake == 0 {
            return;
        }

        self.stakes
            .insert(account.node_pubkey.clone(), account.activated_stake);
    }

    pub fn stake_of(&self, identity: &Identity) -> Option<u64> {
        self.stakes.get(identity).copied()
    }

    /// Share of total stake, `None` for peers without a stake record
    pub fn fraction_of(&self, identity: &Identity) -> Option<f64> {
        let stake = self.stake_of(identity)?;
        if self.total_stake == 0 {
            return Some(0.0);
        }
        Some(stake as f64 / self.total_stake as f64)
    }
}
