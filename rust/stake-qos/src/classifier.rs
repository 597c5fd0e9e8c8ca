//! Stake Classifier
//!
//! Maps one peer to a placement: a single target class plus every other
//! class to evict the peer's addresses from.

use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

use crate::classes::ClassTable;
use crate::error::{QosError, Result};
use crate::types::ClusterNode;

/// Where a peer's addresses belong this tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement<'a> {
    pub target: &'a str,
    pub evict: Vec<&'a str>,
}

/// Place a peer with stake `fraction`.
///
/// The target is the first class in table order whose threshold is strictly
/// below `fraction`; all other classes are evictions.
pub fn classify(fraction: f64, table: &ClassTable) -> Placement<'_> {
    place_in(table, table.class_for(fraction).name.as_str())
}

/// Placement for a peer with no stake record
pub fn classify_unstaked(table: &ClassTable) -> Placement<'_> {
    place_in(table, table.unstaked().name.as_str())
}

/// `None` means the peer has no stake record
pub fn place(fraction: Option<f64>, table: &ClassTable) -> Placement<'_> {
    match fraction {
        Some(fraction) => classify(fraction, table),
        None => classify_unstaked(table),
    }
}

fn place_in<'a>(table: &'a ClassTable, target: &'a str) -> Placement<'a> {
    Placement {
        target,
        evict: table.names().filter(|name| *name != target).collect(),
    }
}

/// Host part of a `host:port` endpoint
pub fn parse_host(address: &str) -> Result<IpAddr> {
    address
        .parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .map_err(|e| QosError::AddressParse {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Addresses to place for a peer: the gossip host, plus the TPU host when it
/// differs.
///
/// `Ok(None)` means the peer has no IPv4 gossip host and must be skipped.
/// A bad TPU address only loses the TPU host. Class groups are `hash:ip`
/// sets, which only hold IPv4 addresses.
pub fn peer_addresses(node: &ClusterNode) -> Result<Option<Vec<IpAddr>>> {
    let gossip = match node.gossip_address.as_deref() {
        Some(gossip) => parse_host(gossip)?,
        None => return Ok(None),
    };

    if gossip.is_ipv6() {
        debug!("Skipping IPv6 gossip host {} of {}", gossip, node.identity);
        return Ok(None);
    }

    let mut addresses = vec![gossip];

    if let Some(tpu) = node.tpu_address.as_deref().filter(|tpu| !tpu.is_empty()) {
        match parse_host(tpu) {
            Ok(host) if host.is_ipv6() => {
                debug!("Skipping IPv6 tpu host {} of {}", host, node.identity)
            }
            Ok(host) if host != gossip => addresses.push(host),
            Ok(_) => {}
            Err(e) => warn!("Couldn't parse tpu host of {}: {}", node.identity, e),
        }
    }

    Ok(Some(addresses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrafficClass;

    fn table() -> ClassTable {
        ClassTable::build(
            vec![TrafficClass::new("A", 0.05, 1), TrafficClass::new("B", 0.01, 2)],
            TrafficClass::new("unstaked", 0.0, 3),
        )
        .unwrap()
    }

    #[test]
    fn test_scenario_placements() {
        let table = table();

        let high = classify(0.07, &table);
        assert_eq!(high.target, "A");
        assert_eq!(high.evict, vec!["B", "unstaked"]);

        let mid = classify(0.02, &table);
        assert_eq!(mid.target, "B");
        assert_eq!(mid.evict, vec!["A", "unstaked"]);

        let none = place(None, &table);
        assert_eq!(none.target, "unstaked");
        assert_eq!(none.evict, vec!["A", "B"]);
    }

    #[test]
    fn test_every_class_appears_once() {
        let table = table();
        for fraction in [0.0, 0.005, 0.01, 0.011, 0.05, 0.5, 1.0] {
            let placement = classify(fraction, &table);
            assert_eq!(placement.evict.len(), table.len() - 1);
            assert!(!placement.evict.contains(&placement.target));
            for name in table.names() {
                assert!(placement.target == name || placement.evict.contains(&name));
            }

            // Target has the greatest threshold strictly below the fraction
            let target = table.get(placement.target).unwrap();
            assert!(target.threshold < fraction);
            for name in &placement.evict {
                let class = table.get(name).unwrap();
                assert!(class.threshold >= fraction || class.threshold <= target.threshold);
            }
        }
    }

    #[test]
    fn test_staked_below_lowest_bar_is_unstaked() {
        let table = table();
        assert_eq!(classify(0.001, &table).target, "unstaked");
        assert_eq!(place(Some(0.0), &table).target, "unstaked");
    }

    #[test]
    fn test_peer_addresses_gossip_only() {
        let node = ClusterNode::new("P", Some("1.2.3.4:8000"), None);
        let addrs = peer_addresses(&node).unwrap().unwrap();
        assert_eq!(addrs, vec!["1.2.3.4".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_peer_addresses_distinct_tpu() {
        let node = ClusterNode::new("P", Some("1.2.3.4:8000"), Some("5.6.7.8:8003"));
        let addrs = peer_addresses(&node).unwrap().unwrap();
        assert_eq!(addrs.len(), 2);

        let same = ClusterNode::new("P", Some("1.2.3.4:8000"), Some("1.2.3.4:8003"));
        assert_eq!(peer_addresses(&same).unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_peer_addresses_bad_tpu_keeps_gossip() {
        let node = ClusterNode::new("P", Some("1.2.3.4:8000"), Some("garbage"));
        assert_eq!(peer_addresses(&node).unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_peer_addresses_without_gossip() {
        let node = ClusterNode::new("P", None, Some("5.6.7.8:8003"));
        assert_eq!(peer_addresses(&node).unwrap(), None);
    }

    #[test]
    fn test_bad_gossip_address() {
        let node = ClusterNode::new("P", Some("not-an-endpoint"), None);
        assert!(matches!(
            peer_addresses(&node),
            Err(QosError::AddressParse { .. })
        ));
    }

    #[test]
    fn test_peer_addresses_skip_ipv6() {
        let v6 = ClusterNode::new("P", Some("[2001:db8::1]:8001"), None);
        assert_eq!(peer_addresses(&v6).unwrap(), None);

        let mixed = ClusterNode::new("P", Some("1.2.3.4:8000"), Some("[2001:db8::2]:8003"));
        assert_eq!(
            peer_addresses(&mixed).unwrap().unwrap(),
            vec!["1.2.3.4".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn test_parse_host_ipv6() {
        assert_eq!(
            parse_host("[::1]:8001").unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
    }
}
