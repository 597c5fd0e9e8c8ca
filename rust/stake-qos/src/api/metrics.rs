//! Metrics Collection
//!
//! Counters and gauges updated by the reconciler and exposed by the API.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use crate::ports::ValidatorPorts;

/// Metrics collector for the reconciliation loop
#[derive(Default)]
pub struct Metrics {
    /// Start time for uptime calculation
    start_time: Option<Instant>,

    /// Completed ticks
    pub ticks: AtomicU64,

    /// Ticks abandoned because a fetch failed
    pub fetch_failures: AtomicU64,

    /// Failed rule sync calls
    pub rule_failures: AtomicU64,

    /// Validator port changes handled
    pub port_changes: AtomicU64,

    /// Addresses reaped after leaving gossip
    pub reaped_addresses: AtomicU64,

    /// Nodes seen in the last tick
    pub nodes_seen: AtomicU64,

    /// Peers classified in the last tick
    pub peers_classified: AtomicU64,

    /// Peers skipped in the last tick
    pub peers_skipped: AtomicU64,

    /// Installed TPU port, 0 when none
    pub tpu_port: AtomicU64,

    /// Installed TPU QUIC port, 0 when none
    pub tpu_quic_port: AtomicU64,

    /// Unix time of the last completed tick, 0 before the first
    pub last_tick_unix: AtomicI64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    pub fn inc_fetch_failures(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rule_failures(&self, count: usize) {
        self.rule_failures.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_port_changes(&self) {
        self.port_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_reaped(&self, count: usize) {
        self.reaped_addresses.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record a completed tick
    pub fn record_tick(&self, nodes: usize, classified: usize, skipped: usize) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.nodes_seen.store(nodes as u64, Ordering::Relaxed);
        self.peers_classified.store(classified as u64, Ordering::Relaxed);
        self.peers_skipped.store(skipped as u64, Ordering::Relaxed);
        self.last_tick_unix
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn set_ports(&self, ports: Option<ValidatorPorts>) {
        let (tpu, quic) = ports.map(|p| (p.tpu, p.tpu_quic)).unwrap_or((0, 0));
        self.tpu_port.store(tpu as u64, Ordering::Relaxed);
        self.tpu_quic_port.store(quic as u64, Ordering::Relaxed);
    }

    /// Last tick as RFC 3339, if any
    pub fn last_tick(&self) -> Option<String> {
        let secs = self.last_tick_unix.load(Ordering::Relaxed);
        if secs == 0 {
            return None;
        }
        chrono::DateTime::from_timestamp(secs, 0).map(|t| t.to_rfc3339())
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let mut push = |name: &str, kind: &str, help: &str, value: u64| {
            output.push_str(&format!(
                "# HELP stake_qos_{name} {help}\n\
                 # TYPE stake_qos_{name} {kind}\n\
                 stake_qos_{name} {value}\n\n"
            ));
        };

        push("uptime_seconds", "gauge", "Service uptime in seconds", self.uptime_secs());
        push("ticks_total", "counter", "Completed reconciliation ticks", self.ticks.load(Ordering::Relaxed));
        push(
            "fetch_failures_total",
            "counter",
            "Ticks retried after a failed fetch",
            self.fetch_failures.load(Ordering::Relaxed),
        );
        push(
            "rule_failures_total",
            "counter",
            "Failed rule sync calls",
            self.rule_failures.load(Ordering::Relaxed),
        );
        push(
            "port_changes_total",
            "counter",
            "Validator port changes handled",
            self.port_changes.load(Ordering::Relaxed),
        );
        push(
            "reaped_addresses_total",
            "counter",
            "Addresses reaped after leaving gossip",
            self.reaped_addresses.load(Ordering::Relaxed),
        );
        push("nodes_seen", "gauge", "Nodes seen in the last tick", self.nodes_seen.load(Ordering::Relaxed));
        push(
            "peers_classified",
            "gauge",
            "Peers classified in the last tick",
            self.peers_classified.load(Ordering::Relaxed),
        );
        push(
            "peers_skipped",
            "gauge",
            "Peers skipped in the last tick",
            self.peers_skipped.load(Ordering::Relaxed),
        );
        push("tpu_port", "gauge", "Installed TPU port", self.tpu_port.load(Ordering::Relaxed));

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "uptime_secs": self.uptime_secs(),
            "ticks": self.ticks.load(Ordering::Relaxed),
            "last_tick": self.last_tick(),
            "failures": {
                "fetch": self.fetch_failures.load(Ordering::Relaxed),
                "rule": self.rule_failures.load(Ordering::Relaxed),
            },
            "port_changes": self.port_changes.load(Ordering::Relaxed),
            "reaped_addresses": self.reaped_addresses.load(Ordering::Relaxed),
            "last_tick_counts": {
                "nodes": self.nodes_seen.load(Ordering::Relaxed),
                "classified": self.peers_classified.load(Ordering::Relaxed),
                "skipped": self.peers_skipped.load(Ordering::Relaxed),
            },
            "ports": {
                "tpu": self.tpu_port.load(Ordering::Relaxed),
                "tpu_quic": self.tpu_quic_port.load(Ordering::Relaxed),
            },
        })
    }
}
