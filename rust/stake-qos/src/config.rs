//! Service Configuration
//!
//! Traffic classes and loop timing come from a TOML file; identity, RPC
//! endpoint and chain verdicts come from the command line. Both end up in
//! immutable values handed to the reconciler at construction.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{QosError, Result};
use crate::rules::layout::{ChainPolicies, GOSSIP_GROUP};
use crate::types::{Identity, TrafficClass, UNSTAKED_THRESHOLD};

/// Longest set name the kernel accepts (IPSET_MAXNAMELEN - 1)
pub const MAX_GROUP_NAME_LEN: usize = 31;

/// Traffic class file contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosConfig {
    // === Timing ===

    /// Interval between reconciliation ticks (seconds)
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Backoff after a failed fetch before retrying the tick (seconds)
    #[serde(default = "default_fetch_retry_secs")]
    pub fetch_retry_secs: u64,

    /// Drop addresses unseen in gossip for this many ticks (0 = never)
    #[serde(default)]
    pub reap_after_ticks: u64,

    // === Classes ===

    /// Staked tiers, any order
    #[serde(default)]
    pub staked_classes: Vec<TrafficClass>,

    /// Class for peers visible in gossip without stake
    pub unstaked_class: TrafficClass,
}

fn default_tick_interval_secs() -> u64 {
    10
}

fn default_fetch_retry_secs() -> u64 {
    5
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            fetch_retry_secs: default_fetch_retry_secs(),
            reap_after_ticks: 0,
            staked_classes: vec![
                TrafficClass::new("solana-high-staked", 0.01, 3),
                TrafficClass::new("solana-staked", 0.0, 5),
            ],
            unstaked_class: TrafficClass::new("solana-unstaked", UNSTAKED_THRESHOLD, 9),
        }
    }
}

impl QosConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        // The file never decides the unstaked bar
        config.unstaked_class.threshold = UNSTAKED_THRESHOLD;
        Ok(config)
    }

    // Builder-style methods for CLI overrides

    pub fn with_tick_interval_secs(mut self, secs: Option<u64>) -> Self {
        if let Some(secs) = secs {
            self.tick_interval_secs = secs;
        }
        self
    }

    pub fn with_reap_after_ticks(mut self, ticks: Option<u64>) -> Self {
        if let Some(ticks) = ticks {
            self.reap_after_ticks = ticks;
        }
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn fetch_retry(&self) -> Duration {
        Duration::from_secs(self.fetch_retry_secs)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            return Err(QosError::config("tick_interval_secs must be positive"));
        }

        if self.fetch_retry_secs >= self.tick_interval_secs {
            return Err(QosError::config(format!(
                "fetch_retry_secs ({}) must be less than tick_interval_secs ({})",
                self.fetch_retry_secs, self.tick_interval_secs
            )));
        }

        let mut names = HashSet::new();
        for class in self.staked_classes.iter().chain(std::iter::once(&self.unstaked_class)) {
            if class.name.trim().is_empty() {
                return Err(QosError::config("class names must not be empty"));
            }
            if class.name.len() > MAX_GROUP_NAME_LEN {
                return Err(QosError::config(format!(
                    "class name {:?} is longer than {} characters",
                    class.name, MAX_GROUP_NAME_LEN
                )));
            }
            if class.name == GOSSIP_GROUP {
                return Err(QosError::config(format!(
                    "class name {:?} is reserved for the gossip peer group",
                    class.name
                )));
            }
            if !names.insert(class.name.as_str()) {
                return Err(QosError::config(format!("duplicate class name {:?}", class.name)));
            }
        }

        for class in &self.staked_classes {
            if !class.threshold.is_finite()
                || class.threshold <= UNSTAKED_THRESHOLD
                || class.threshold > 1.0
            {
                return Err(QosError::config(format!(
                    "stake_percentage {} of class {:?} must be in (-1, 1]",
                    class.threshold, class.name
                )));
            }
        }

        Ok(())
    }
}

/// Command-line side of the configuration
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Local validator identity; `None` selects the passthrough policy
    pub identity: Option<Identity>,

    /// Cluster JSON-RPC endpoint
    pub rpc_uri: String,

    /// Verdicts appended to the tpu, forward and vote filter chains
    pub policies: ChainPolicies,

    /// Keep class groups updated every tick
    pub update_groups: bool,

    /// Log rule mutations against an in-memory backend instead of the kernel
    pub dry_run: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            identity: None,
            rpc_uri: "https://api.mainnet-beta.solana.com".to_string(),
            policies: ChainPolicies::default(),
            update_groups: true,
            dry_run: false,
        }
    }
}
