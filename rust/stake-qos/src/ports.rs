//! Validator Port Tracking
//!
//! Watches the local node's advertised TPU endpoints and reports when the
//! port-keyed rules must be installed, or torn down and rebuilt.
//!
//! ```text
//!   Unknown ──observe──► Tracking(ports) ──observe(same)──► Tracking(ports)
//!                              │
//!                              └──observe(new)──► teardown(old), install(new)
//! ```

use serde::Serialize;
use tracing::warn;

use crate::error::{QosError, Result};

/// Offset of the QUIC TPU port from the UDP TPU port when the node does not
/// advertise one
pub const QUIC_PORT_OFFSET: u16 = 6;

/// Ports derived from the local node's TPU endpoints.
///
/// Derivation is unchecked u16 arithmetic and wraps at the top of the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ValidatorPorts {
    pub tpu: u16,
    pub tpu_forward: u16,
    pub tpu_vote: u16,
    pub tpu_quic: u16,
    pub tpu_quic_forward: u16,
}

impl ValidatorPorts {
    pub fn new(tpu: u16, tpu_quic: u16) -> Self {
        Self {
            tpu,
            tpu_forward: tpu.wrapping_add(1),
            tpu_vote: tpu.wrapping_add(2),
            tpu_quic,
            tpu_quic_forward: tpu_quic.wrapping_add(1),
        }
    }

    /// Ports for a node that only advertises the UDP TPU endpoint
    pub fn from_tpu(tpu: u16) -> Self {
        Self::new(tpu, tpu.wrapping_add(QUIC_PORT_OFFSET))
    }

    /// True when one of the derived ports wrapped past 65535
    pub fn wrapped(&self) -> bool {
        self.tpu_forward < self.tpu
            || self.tpu_vote < self.tpu
            || self.tpu_quic_forward < self.tpu_quic
    }
}

/// Rule work the reconciler must carry out, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortIntent {
    Teardown(ValidatorPorts),
    Install(ValidatorPorts),
}

/// Outcome of one observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Ports match the installed set
    Unchanged,

    /// First observation
    Installed(ValidatorPorts),

    /// Ports moved
    Changed {
        old: ValidatorPorts,
        new: ValidatorPorts,
    },
}

impl Transition {
    /// Intents in execution order; teardown always precedes install
    pub fn intents(&self) -> Vec<PortIntent> {
        match *self {
            Transition::Unchanged => Vec::new(),
            Transition::Installed(ports) => vec![PortIntent::Install(ports)],
            Transition::Changed { old, new } => {
                vec![PortIntent::Teardown(old), PortIntent::Install(new)]
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum TrackerState {
    #[default]
    Unknown,
    Tracking(ValidatorPorts),
}

/// Holds the currently installed port set
#[derive(Debug, Clone, Default)]
pub struct PortTracker {
    state: TrackerState,
}

impl PortTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports whose rules are installed, if any
    pub fn current(&self) -> Option<ValidatorPorts> {
        match self.state {
            TrackerState::Unknown => None,
            TrackerState::Tracking(ports) => Some(ports),
        }
    }

    /// Feed the local node's advertised endpoints.
    ///
    /// On a parse error the tracker keeps its previous state.
    pub fn observe(&mut self, tpu_address: &str, tpu_quic_address: Option<&str>) -> Result<Transition> {
        let tpu = parse_port(tpu_address)?;
        let ports = match tpu_quic_address {
            Some(quic) => ValidatorPorts::new(tpu, parse_port(quic)?),
            None => ValidatorPorts::from_tpu(tpu),
        };

        if ports.wrapped() {
            warn!("Derived validator ports wrap past 65535: {:?}", ports);
        }

        let transition = match self.state {
            TrackerState::Unknown => Transition::Installed(ports),
            TrackerState::Tracking(old) if old == ports => Transition::Unchanged,
            TrackerState::Tracking(old) => Transition::Changed { old, new: ports },
        };

        self.state = TrackerState::Tracking(ports);
        Ok(transition)
    }
}

/// Port part of a `host:port` endpoint
pub fn parse_port(address: &str) -> Result<u16> {
    let err = |reason: String| QosError::PortParse {
        address: address.to_string(),
        reason,
    };

    let (_, port) = address
        .rsplit_once(':')
        .ok_or_else(|| err("missing port".to_string()))?;

    port.parse::<u16>().map_err(|e| err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_ports() {
        let ports = ValidatorPorts::from_tpu(8003);
        assert_eq!(ports.tpu_forward, 8004);
        assert_eq!(ports.tpu_vote, 8005);
        assert_eq!(ports.tpu_quic, 8009);
        assert_eq!(ports.tpu_quic_forward, 8010);
        assert!(!ports.wrapped());

        let ports = ValidatorPorts::new(8003, 8100);
        assert_eq!(ports.tpu_quic_forward, 8101);
    }

    #[test]
    fn test_wrapping_is_flagged() {
        let ports = ValidatorPorts::from_tpu(u16::MAX);
        assert_eq!(ports.tpu_forward, 0);
        assert!(ports.wrapped());
    }

    #[test]
    fn test_first_observation_installs() {
        let mut tracker = PortTracker::new();
        assert_eq!(tracker.current(), None);

        let transition = tracker.observe("10.0.0.1:8003", None).unwrap();
        let ports = ValidatorPorts::from_tpu(8003);
        assert_eq!(transition, Transition::Installed(ports));
        assert_eq!(transition.intents(), vec![PortIntent::Install(ports)]);
        assert_eq!(tracker.current(), Some(ports));
    }

    #[test]
    fn test_same_port_is_noop() {
        let mut tracker = PortTracker::new();
        tracker.observe("10.0.0.1:8003", None).unwrap();

        let transition = tracker.observe("10.0.0.1:8003", None).unwrap();
        assert_eq!(transition, Transition::Unchanged);
        assert!(transition.intents().is_empty());

        // Host moves don't matter, only ports
        let transition = tracker.observe("10.0.0.2:8003", None).unwrap();
        assert!(transition.intents().is_empty());
    }

    #[test]
    fn test_port_change_tears_down_first() {
        let mut tracker = PortTracker::new();
        tracker.observe("10.0.0.1:8003", None).unwrap();

        let transition = tracker.observe("10.0.0.1:9100", None).unwrap();
        let old = ValidatorPorts::from_tpu(8003);
        let new = ValidatorPorts::from_tpu(9100);
        assert_eq!(
            transition.intents(),
            vec![PortIntent::Teardown(old), PortIntent::Install(new)]
        );
        assert_eq!(new.tpu_forward, 9101);
        assert_eq!(new.tpu_vote, 9102);
        assert_eq!(tracker.current(), Some(new));
    }

    #[test]
    fn test_quic_change_is_a_change() {
        let mut tracker = PortTracker::new();
        tracker.observe("10.0.0.1:8003", Some("10.0.0.1:8009")).unwrap();
        let transition = tracker
            .observe("10.0.0.1:8003", Some("10.0.0.1:8500"))
            .unwrap();
        assert!(matches!(transition, Transition::Changed { .. }));
    }

    #[test]
    fn test_parse_error_keeps_state() {
        let mut tracker = PortTracker::new();
        tracker.observe("10.0.0.1:8003", None).unwrap();

        assert!(matches!(
            tracker.observe("10.0.0.1:notaport", None),
            Err(QosError::PortParse { .. })
        ));
        assert!(tracker.observe("10.0.0.1:9000", Some("nocolon")).is_err());
        assert!(tracker.observe("10.0.0.1:70000", None).is_err());
        assert_eq!(tracker.current(), Some(ValidatorPorts::from_tpu(8003)));
    }

    #[test]
    fn test_parse_port_ipv6() {
        assert_eq!(parse_port("[::1]:8003").unwrap(), 8003);
    }
}
