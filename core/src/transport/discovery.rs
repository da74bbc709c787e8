// Discovery — find active nodes within radio range
//
// A scan is pure bookkeeping over the registry: which peers are close
// enough to hear us, and which of those we should try to link with.
// Opening the links is left to the caller so it can go through the
// transport without holding the network lock.

use super::abstraction::LinkType;
use crate::node::{GeoLocation, NodeId, NodeRegistry, NodeStatus};
use crate::MeshResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Mean Earth radius used by the haversine formula
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two fixes, in metres
pub fn haversine_distance_m(a: &GeoLocation, b: &GeoLocation) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// A peer worth linking with
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryCandidate {
    pub peer_id: NodeId,
    pub link_type: LinkType,
    pub distance_m: f64,
}

/// What one scan found
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPlan {
    /// Every reachable peer in range, connected or not
    pub in_range: Vec<NodeId>,
    /// Unlinked peers with a compatible link type, nearest first
    pub candidates: Vec<DiscoveryCandidate>,
}

/// Result of a discovery pass, reported for observability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub scanner_id: NodeId,
    pub nodes_discovered: Vec<NodeId>,
    pub new_connections: Vec<NodeId>,
    pub scan_duration: Duration,
}

/// Scan the registry from `scanner`'s last known location.
///
/// Peers count as in range within `max(scanner.range, peer.range)`.
pub fn scan_candidates(registry: &NodeRegistry, scanner: &str) -> MeshResult<ScanPlan> {
    let local = registry.require(scanner)?;
    let mut plan = ScanPlan::default();

    for peer in registry.iter() {
        // Disconnected peers are alive but isolated, so they stay discoverable
        let reachable = matches!(peer.status, NodeStatus::Active | NodeStatus::Disconnected);
        if peer.id == local.id || !reachable {
            continue;
        }

        let distance_m = haversine_distance_m(&local.location, &peer.location);
        let range_m = local.capabilities.range_m.max(peer.capabilities.range_m);
        if distance_m > range_m {
            continue;
        }

        plan.in_range.push(peer.id.clone());

        if local.is_connected_to(&peer.id) {
            continue;
        }
        if let Some(link_type) = local.capabilities.first_compatible_link(&peer.capabilities) {
            plan.candidates.push(DiscoveryCandidate {
                peer_id: peer.id.clone(),
                link_type,
                distance_m,
            });
        }
    }

    plan.candidates
        .sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeCapabilities};

    fn at(lat: f64, lon: f64) -> GeoLocation {
        GeoLocation {
            latitude: lat,
            longitude: lon,
            accuracy_m: 5.0,
            timestamp: 0,
        }
    }

    fn add_active(registry: &mut NodeRegistry, name: &str, caps: NodeCapabilities, loc: GeoLocation) -> NodeId {
        let id = registry
            .register(Node::new(format!("dev-{}", name), name.to_string(), caps, loc, 0))
            .unwrap();
        registry.set_status(&id, NodeStatus::Active).unwrap();
        id
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.2 km
        let d = haversine_distance_m(&at(0.0, 0.0), &at(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 50.0, "got {}", d);
        assert_eq!(haversine_distance_m(&at(12.0, 34.0), &at(12.0, 34.0)), 0.0);
    }

    #[test]
    fn test_haversine_is_symmetric() {
        let a = at(37.7749, -122.4194);
        let b = at(37.7790, -122.4180);
        assert!((haversine_distance_m(&a, &b) - haversine_distance_m(&b, &a)).abs() < 1e-9);
    }

    #[test]
    fn test_range_uses_larger_radio() {
        let mut registry = NodeRegistry::new(10);
        // ~1.1 km apart: out of handheld range, inside the station's
        let phone = add_active(&mut registry, "phone", NodeCapabilities::handheld(), at(0.0, 0.0));
        let station = add_active(&mut registry, "station", NodeCapabilities::relay_station(), at(0.01, 0.0));

        let from_phone = scan_candidates(&registry, &phone).unwrap();
        let from_station = scan_candidates(&registry, &station).unwrap();

        assert_eq!(from_phone.in_range, vec![station.clone()]);
        assert_eq!(from_station.in_range, vec![phone.clone()]);
        assert_eq!(from_phone.candidates[0].link_type, LinkType::Bluetooth);
        assert_eq!(from_station.candidates[0].link_type, LinkType::WifiDirect);
    }

    #[test]
    fn test_skips_inactive_and_distant() {
        let mut registry = NodeRegistry::new(10);
        let me = add_active(&mut registry, "me", NodeCapabilities::handheld(), at(0.0, 0.0));
        let far = add_active(&mut registry, "far", NodeCapabilities::handheld(), at(0.5, 0.0));
        let idle = add_active(&mut registry, "idle", NodeCapabilities::handheld(), at(0.0001, 0.0));
        registry.set_status(&idle, NodeStatus::Inactive).unwrap();

        let plan = scan_candidates(&registry, &me).unwrap();
        assert!(plan.in_range.is_empty());
        assert!(plan.candidates.is_empty());
        assert!(registry.contains(&far));
    }

    #[test]
    fn test_isolated_peer_is_still_a_candidate() {
        let mut registry = NodeRegistry::new(10);
        let me = add_active(&mut registry, "me", NodeCapabilities::handheld(), at(0.0, 0.0));
        let lone = add_active(&mut registry, "lone", NodeCapabilities::handheld(), at(0.0001, 0.0));
        registry.set_status(&lone, NodeStatus::Disconnected).unwrap();

        let plan = scan_candidates(&registry, &me).unwrap();
        assert_eq!(plan.in_range, vec![lone.clone()]);
        assert_eq!(plan.candidates[0].peer_id, lone);
    }

    #[test]
    fn test_incompatible_peer_seen_but_not_candidate() {
        let mut registry = NodeRegistry::new(10);
        let me = add_active(&mut registry, "me", NodeCapabilities::handheld(), at(0.0, 0.0));
        let lora_only = NodeCapabilities {
            supported_links: vec![LinkType::LoRa],
            ..NodeCapabilities::relay_station()
        };
        let beacon = add_active(&mut registry, "beacon", lora_only, at(0.0002, 0.0));

        let plan = scan_candidates(&registry, &me).unwrap();
        assert_eq!(plan.in_range, vec![beacon]);
        assert!(plan.candidates.is_empty());
    }

    #[test]
    fn test_candidates_nearest_first() {
        let mut registry = NodeRegistry::new(10);
        let me = add_active(&mut registry, "me", NodeCapabilities::handheld(), at(0.0, 0.0));
        let further = add_active(&mut registry, "further", NodeCapabilities::handheld(), at(0.0006, 0.0));
        let nearer = add_active(&mut registry, "nearer", NodeCapabilities::handheld(), at(0.0002, 0.0));

        let plan = scan_candidates(&registry, &me).unwrap();
        let order: Vec<_> = plan.candidates.iter().map(|c| c.peer_id.clone()).collect();
        assert_eq!(order, vec![nearer, further]);
    }
}
