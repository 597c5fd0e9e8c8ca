//! Stake QoS Service
//!
//! Classifies validator peers by their share of active stake and keeps
//! kernel address groups and packet-marking rules in step with the cluster.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        STAKE QOS                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Cluster RPC        ←── vote accounts, gossip nodes         │
//! │  Reconciler         ←── classify peers every tick           │
//! │  Port Tracker       ←── follow the local node's TPU ports   │
//! │  Rule Sync          ──► ipset groups, iptables chains       │
//! │  Signal Listener    ──► cleanup on SIGINT/SIGTERM           │
//! │  HTTP API (opt.)    ←── health, status, metrics             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

mod api;
mod classes;
mod classifier;
mod config;
mod error;
mod ledger;
mod membership;
mod ports;
mod reconciler;
mod rpc;
mod rules;
mod shutdown;
mod types;

use api::{ApiState, Metrics};
use classes::ClassTable;
use config::{QosConfig, RuntimeOptions};
use reconciler::{Reconciler, ReconcilerSettings};
use rpc::{ClusterRpc, JsonRpcClient};
use rules::layout::{self, ChainPolicies};
use rules::{CommandRuleSync, MemoryRuleSync, RuleSync};
use shutdown::{ShutdownCoordinator, SHUTDOWN_EXIT_CODE};
use types::{ChainPolicy, Identity};

/// RPC endpoint of a validator running on this host
const LOCAL_RPC_URI: &str = "http://localhost:8899";

/// Stake QoS - stake-weighted packet marking for validators
#[derive(Parser, Debug)]
#[command(name = "stake-qos")]
#[command(author = "stake-qos Contributors")]
#[command(version)]
#[command(about = "Mark validator traffic by the sender's share of stake", long_about = None)]
struct Args {
    /// Path to the traffic class file
    #[arg(short, long, default_value = "stake-qos.toml")]
    config: PathBuf,

    /// Local validator identity (base58 pubkey)
    #[arg(long)]
    identity: Option<String>,

    /// Ask the RPC node for its identity
    #[arg(long)]
    fetch_identity: bool,

    /// Cluster JSON-RPC endpoint
    #[arg(long, default_value = "https://api.mainnet-beta.solana.com")]
    rpc_uri: String,

    /// Use the validator on this host for RPC and identity
    #[arg(long)]
    local_rpc: bool,

    /// Verdict for TPU traffic after the custom chain
    #[arg(long, value_enum, ignore_case = true)]
    tpu_policy: Option<ChainPolicy>,

    /// Verdict for TPU forward traffic after the custom chain
    #[arg(long, value_enum, ignore_case = true)]
    fwd_policy: Option<ChainPolicy>,

    /// Verdict for vote traffic after the custom chain
    #[arg(long, value_enum, ignore_case = true)]
    vote_policy: Option<ChainPolicy>,

    /// Keep class groups updated with stake changes
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    update: bool,

    /// Log rule mutations without touching the kernel
    #[arg(long)]
    dry_run: bool,

    /// Override the tick interval from the config file (seconds)
    #[arg(long)]
    tick_interval: Option<u64>,

    /// Override reap_after_ticks from the config file
    #[arg(long)]
    reap_after_ticks: Option<u64>,

    /// Serve status and metrics on this port
    #[arg(long)]
    api_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn runtime_options(&self) -> RuntimeOptions {
        let rpc_uri = if self.local_rpc {
            LOCAL_RPC_URI.to_string()
        } else {
            self.rpc_uri.clone()
        };

        RuntimeOptions {
            identity: self.identity.as_deref().map(Identity::new),
            rpc_uri,
            policies: ChainPolicies {
                tpu: self.tpu_policy,
                fwd: self.fwd_policy,
                vote: self.vote_policy,
            },
            update_groups: self.update,
            dry_run: self.dry_run,
        }
    }

    fn wants_fetched_identity(&self) -> bool {
        self.fetch_identity || self.local_rpc
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    info!("🛡️  Stake QoS v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration; there is no sensible default class layout
    let config = QosConfig::load(&args.config)
        .with_context(|| format!("loading config {:?}", args.config))?
        .with_tick_interval_secs(args.tick_interval)
        .with_reap_after_ticks(args.reap_after_ticks);

    config.validate()?;

    let table = Arc::new(ClassTable::build(
        config.staked_classes.clone(),
        config.unstaked_class.clone(),
    )?);

    info!("⚙️  Configuration:");
    info!("   Tick interval: {}s", config.tick_interval_secs);
    info!("   Fetch retry: {}s", config.fetch_retry_secs);
    if config.reap_after_ticks > 0 {
        info!("   Reap after: {} ticks", config.reap_after_ticks);
    }
    for class in table.classes() {
        info!(
            "   Class {}: stake > {}, fwmark {}",
            class.name, class.threshold, class.fwmark
        );
    }

    let mut options = args.runtime_options();
    info!("   RPC: {}", options.rpc_uri);

    let rpc: Arc<dyn ClusterRpc> = Arc::new(JsonRpcClient::new(&options.rpc_uri)?);

    if options.identity.is_none() && args.wants_fetched_identity() {
        options.identity = fetch_identity(rpc.as_ref()).await;
    }
    match &options.identity {
        Some(identity) => info!("📝 Validator identity: {}", identity),
        None => warn!("No validator identity: all UDP traffic goes through the class chain"),
    }

    let rules: Arc<dyn RuleSync> = if options.dry_run {
        info!("Dry run: rule mutations are logged, not applied");
        Arc::new(MemoryRuleSync::logging())
    } else {
        Arc::new(CommandRuleSync::init().await?)
    };

    layout::install_base(
        rules.as_ref(),
        &table,
        &options.policies,
        options.identity.is_none(),
    )
    .await?;

    let metrics = Arc::new(Metrics::new());
    let (trigger, signal) = shutdown::channel();

    tokio::spawn({
        let trigger = trigger.clone();
        async move {
            if let Err(e) = shutdown::listen_for_signals(trigger.clone()).await {
                error!("Signal listener failed: {}; shutting down", e);
                trigger.trigger();
            }
        }
    });

    if let Some(port) = args.api_port {
        let state = Arc::new(ApiState {
            identity: options.identity.clone(),
            table: table.clone(),
            metrics: metrics.clone(),
        });
        tokio::spawn(async move {
            if let Err(e) = api::run_api_server(port, state).await {
                error!("HTTP API exited: {}", e);
            }
        });
    }

    let settings = ReconcilerSettings::from_config(&config, options.identity.clone(), options.update_groups);
    let reconciler = Reconciler::new(rpc, rules.clone(), table.clone(), settings, metrics);

    info!("✅ Started");
    info!("   Press Ctrl+C to clean up and exit");

    let tracker = reconciler.run(signal).await;

    ShutdownCoordinator::new(rules, table)
        .cleanup(tracker.current())
        .await;

    info!("👋 Stake QoS shutting down");
    std::process::exit(SHUTDOWN_EXIT_CODE);
}

/// Ask the RPC node who it is; failure leaves the service without identity
async fn fetch_identity(rpc: &dyn ClusterRpc) -> Option<Identity> {
    match rpc.fetch_local_identity().await {
        Ok(identity) => Some(identity),
        Err(e) => {
            warn!("Couldn't fetch validator identity: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["stake-qos"]).unwrap();
        let options = args.runtime_options();

        assert_eq!(options.rpc_uri, "https://api.mainnet-beta.solana.com");
        assert!(options.update_groups);
        assert!(!options.dry_run);
        assert_eq!(options.policies, ChainPolicies::default());
        assert!(!args.wants_fetched_identity());
    }

    #[test]
    fn test_args_local_rpc() {
        let args = Args::try_parse_from(["stake-qos", "--local-rpc"]).unwrap();

        assert_eq!(args.runtime_options().rpc_uri, LOCAL_RPC_URI);
        assert!(args.wants_fetched_identity());
    }

    #[test]
    fn test_args_policies_and_update() {
        let args = Args::try_parse_from([
            "stake-qos",
            "--identity",
            "V1",
            "--tpu-policy",
            "DROP",
            "--vote-policy",
            "accept",
            "--update",
            "false",
        ])
        .unwrap();
        let options = args.runtime_options();

        assert_eq!(options.identity, Some(Identity::new("V1")));
        assert_eq!(options.policies.tpu, Some(ChainPolicy::Drop));
        assert_eq!(options.policies.fwd, None);
        assert_eq!(options.policies.vote, Some(ChainPolicy::Accept));
        assert!(!options.update_groups);
    }

    #[test]
    fn test_args_reject_unknown_policy() {
        assert!(Args::try_parse_from(["stake-qos", "--tpu-policy", "LOG"]).is_err());
    }
}
