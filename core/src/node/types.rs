// Node types — identity, capabilities, location and cumulative metrics

use crate::transport::{Connection, LinkType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique node identifier (UUID v4)
pub type NodeId = String;

/// Lifecycle status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Registered, schedules not yet running
    Connecting,
    /// Participating in discovery and heartbeats
    Active,
    /// Missed several heartbeats
    Inactive,
    Disconnected,
    /// Silent long enough to be considered gone
    Unreachable,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Connecting => write!(f, "connecting"),
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Inactive => write!(f, "inactive"),
            NodeStatus::Disconnected => write!(f, "disconnected"),
            NodeStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in metres
    pub accuracy_m: f64,
    /// Fix time (Unix ms)
    pub timestamp: u64,
}

impl GeoLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m: 10.0,
            timestamp: crate::current_timestamp(),
        }
    }
}

/// What a node's radio stack and hardware can do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapabilities {
    /// Supported link types in order of preference
    pub supported_links: Vec<LinkType>,
    pub max_connections: usize,
    pub bandwidth_kbps: u32,
    /// Radio range in metres
    pub range_m: f64,
    pub relay_capable: bool,
    pub internet_gateway: bool,
    /// Storage budget for custody of queued messages
    pub storage_bytes: u64,
    /// Battery percentage, `None` on mains power
    pub battery_level: Option<u8>,
}

impl NodeCapabilities {
    /// Phone-class handheld: Bluetooth and Wi-Fi Direct, short range
    pub fn handheld() -> Self {
        Self {
            supported_links: vec![LinkType::Bluetooth, LinkType::WifiDirect],
            max_connections: 8,
            bandwidth_kbps: 2_000,
            range_m: 100.0,
            relay_capable: true,
            internet_gateway: false,
            storage_bytes: 512 * 1024 * 1024,
            battery_level: Some(100),
        }
    }

    /// Fixed relay station: long-range LoRa plus local links
    pub fn relay_station() -> Self {
        Self {
            supported_links: vec![LinkType::LoRa, LinkType::WifiDirect, LinkType::Bluetooth],
            max_connections: 32,
            bandwidth_kbps: 10_000,
            range_m: 5_000.0,
            relay_capable: true,
            internet_gateway: true,
            storage_bytes: 8 * 1024 * 1024 * 1024,
            battery_level: None,
        }
    }

    pub fn supports(&self, link: LinkType) -> bool {
        self.supported_links.contains(&link)
    }

    /// First link type in our preference order the other side also supports
    pub fn first_compatible_link(&self, other: &NodeCapabilities) -> Option<LinkType> {
        self.supported_links
            .iter()
            .copied()
            .find(|link| other.supports(*link))
    }
}

/// Cumulative per-node counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    pub uptime_ms: u64,
    pub messages_routed: u64,
    pub messages_originated: u64,
    pub bytes_relayed: u64,
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub average_latency_ms: f64,
    /// Fraction of frames that failed to leave this node
    pub packet_loss: f64,
    pub frames_sent: u64,
    pub frames_lost: u64,
}

impl NodeMetrics {
    /// Record the outcome of one outbound frame
    pub fn record_frame(&mut self, delivered: bool) {
        if delivered {
            self.frames_sent += 1;
        } else {
            self.frames_lost += 1;
        }
        let total = self.frames_sent + self.frames_lost;
        self.packet_loss = self.frames_lost as f64 / total as f64;
    }
}

/// A participant device in the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub device_id: String,
    pub name: String,
    pub status: NodeStatus,
    pub location: GeoLocation,
    pub capabilities: NodeCapabilities,
    /// Links in establishment order
    pub connections: Vec<Connection>,
    pub metrics: NodeMetrics,
    pub joined_at: u64,
    pub last_seen: u64,
}

impl Node {
    pub fn new(
        device_id: String,
        name: String,
        capabilities: NodeCapabilities,
        location: GeoLocation,
        now: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id,
            name,
            status: NodeStatus::Connecting,
            location,
            capabilities,
            connections: Vec::new(),
            metrics: NodeMetrics::default(),
            joined_at: now,
            last_seen: now,
        }
    }

    pub fn connection_to(&self, peer_id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.peer_id == peer_id)
    }

    pub fn connection_to_mut(&mut self, peer_id: &str) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.peer_id == peer_id)
    }

    pub fn is_connected_to(&self, peer_id: &str) -> bool {
        self.connection_to(peer_id).is_some()
    }

    pub fn has_capacity(&self) -> bool {
        self.connections.len() < self.capabilities.max_connections
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.connections.iter().map(|c| &c.peer_id)
    }

    /// Recompute the average link latency from current connections
    pub fn refresh_average_latency(&mut self) {
        self.metrics.average_latency_ms = if self.connections.is_empty() {
            0.0
        } else {
            let sum: u64 = self.connections.iter().map(|c| c.latency_ms as u64).sum();
            sum as f64 / self.connections.len() as f64
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_compatible_link_follows_local_preference() {
        let handheld = NodeCapabilities::handheld();
        let station = NodeCapabilities::relay_station();

        assert_eq!(handheld.first_compatible_link(&station), Some(LinkType::Bluetooth));
        assert_eq!(station.first_compatible_link(&handheld), Some(LinkType::WifiDirect));
    }

    #[test]
    fn test_no_compatible_link() {
        let lora_only = NodeCapabilities {
            supported_links: vec![LinkType::LoRa],
            ..NodeCapabilities::handheld()
        };
        assert_eq!(NodeCapabilities::handheld().first_compatible_link(&lora_only), None);
    }

    #[test]
    fn test_packet_loss() {
        let mut metrics = NodeMetrics::default();
        metrics.record_frame(true);
        metrics.record_frame(true);
        metrics.record_frame(true);
        metrics.record_frame(false);
        assert_eq!(metrics.packet_loss, 0.25);
    }

    #[test]
    fn test_new_node_starts_connecting() {
        let node = Node::new(
            "dev-1".into(),
            "Medic 1".into(),
            NodeCapabilities::handheld(),
            GeoLocation::new(0.0, 0.0),
            5,
        );
        assert_eq!(node.status, NodeStatus::Connecting);
        assert!(node.connections.is_empty());
        assert!(node.has_capacity());
        assert_eq!(node.joined_at, 5);
    }
}
