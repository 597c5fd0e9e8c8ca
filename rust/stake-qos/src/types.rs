//! Core types shared by the classifier, the port tracker and the collaborators
//!
//! Wire-facing types (`ClusterNode`, `VoteAccount`) deserialize straight from
//! the cluster JSON-RPC responses.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// IDENTITY
// =============================================================================

/// Node identity public key, kept in its base58 text form
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for compact log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

// =============================================================================
// TRAFFIC CLASSES
// =============================================================================

/// Threshold carried by the unstaked class; sorts below every staked class
pub const UNSTAKED_THRESHOLD: f64 = -1.0;

/// A named policy tier. Members of the class get `fwmark` set on their packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficClass {
    /// Class name, also the name of its address group
    pub name: String,

    /// Exclusive lower bound on the stake fraction a peer must exceed
    #[serde(rename = "stake_percentage", default)]
    pub threshold: f64,

    /// Packet mark applied to traffic from members
    #[serde(default)]
    pub fwmark: u64,
}

impl TrafficClass {
    pub fn new(name: impl Into<String>, threshold: f64, fwmark: u64) -> Self {
        Self {
            name: name.into(),
            threshold,
            fwmark,
        }
    }

    pub fn is_unstaked(&self) -> bool {
        self.threshold <= UNSTAKED_THRESHOLD
    }
}

// =============================================================================
// CLUSTER STATE (RPC)
// =============================================================================

/// One entry of `getClusterNodes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    #[serde(rename = "pubkey")]
    pub identity: Identity,

    #[serde(rename = "gossip", default)]
    pub gossip_address: Option<String>,

    #[serde(rename = "tpu", default)]
    pub tpu_address: Option<String>,

    #[serde(rename = "tpuQuic", default)]
    pub tpu_quic_address: Option<String>,
}

#[cfg(test)]
impl ClusterNode {
    pub fn new(identity: impl Into<Identity>, gossip: Option<&str>, tpu: Option<&str>) -> Self {
        Self {
            identity: identity.into(),
            gossip_address: gossip.map(str::to_string),
            tpu_address: tpu.map(str::to_string),
            tpu_quic_address: None,
        }
    }
}

/// One vote account as reported by `getVoteAccounts`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteAccount {
    pub node_pubkey: Identity,
    pub activated_stake: u64,
}

#[cfg(test)]
impl VoteAccount {
    pub fn new(identity: impl Into<Identity>, stake: u64) -> Self {
        Self {
            node_pubkey: identity.into(),
            activated_stake: stake,
        }
    }
}

/// `getVoteAccounts` result: voting and delinquent validators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteAccounts {
    #[serde(default)]
    pub current: Vec<VoteAccount>,
    #[serde(default)]
    pub delinquent: Vec<VoteAccount>,
}

// =============================================================================
// CHAIN POLICY
// =============================================================================

/// Default verdict appended to a filter chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChainPolicy {
    Accept,
    Drop,
    Reject,
}

impl ChainPolicy {
    /// iptables jump target
    pub fn target(&self) -> &'static str {
        match self {
            ChainPolicy::Accept => "ACCEPT",
            ChainPolicy::Drop => "DROP",
            ChainPolicy::Reject => "REJECT",
        }
    }
}

impl fmt::Display for ChainPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_short() {
        let id = Identity::new("7Np41oeYqPefeNQEHSv1UDhYrehxin3NStELsSKCT4K2");
        assert_eq!(id.short(), "7Np41oeY");
        assert_eq!(Identity::new("abc").short(), "abc");
    }

    #[test]
    fn test_cluster_node_from_rpc_json() {
        let json = r#"{
            "pubkey": "V1",
            "gossip": "10.0.0.1:8001",
            "tpu": "10.0.0.1:8003",
            "tpuQuic": "10.0.0.1:8009",
            "rpc": null,
            "version": "1.18.0"
        }"#;
        let node: ClusterNode = serde_json::from_str(json).unwrap();
        assert_eq!(node.identity, Identity::new("V1"));
        assert_eq!(node.gossip_address.as_deref(), Some("10.0.0.1:8001"));
        assert_eq!(node.tpu_quic_address.as_deref(), Some("10.0.0.1:8009"));
    }

    #[test]
    fn test_cluster_node_missing_addresses() {
        let node: ClusterNode = serde_json::from_str(r#"{"pubkey": "V2", "gossip": null}"#).unwrap();
        assert!(node.gossip_address.is_none());
        assert!(node.tpu_address.is_none());
    }

    #[test]
    fn test_vote_accounts_from_rpc_json() {
        let json = r#"{
            "current": [{"nodePubkey": "A", "votePubkey": "VA", "activatedStake": 42, "commission": 5}],
            "delinquent": []
        }"#;
        let accounts: VoteAccounts = serde_json::from_str(json).unwrap();
        assert_eq!(accounts.current, vec![VoteAccount::new("A", 42)]);
        assert!(accounts.delinquent.is_empty());
    }

    #[test]
    fn test_unstaked_detection() {
        assert!(TrafficClass::new("u", UNSTAKED_THRESHOLD, 0).is_unstaked());
        assert!(!TrafficClass::new("s", 0.0, 0).is_unstaked());
    }

    #[test]
    fn test_policy_targets() {
        assert_eq!(ChainPolicy::Accept.target(), "ACCEPT");
        assert_eq!(ChainPolicy::Drop.to_string(), "DROP");
    }
}
