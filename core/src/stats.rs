// Network statistics — derived on demand, never stored

use crate::network::Network;
use crate::node::NodeStatus;
use crate::routing::DeliveryState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatistics {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub total_messages: usize,
    pub delivered_messages: usize,
    pub failed_messages: usize,
    pub queued_messages: usize,
    /// Undirected links
    pub total_connections: usize,
    pub average_hop_count: f64,
    /// Longest shortest path in the routing table, in hops
    pub network_diameter: usize,
    /// Mean latency over every connection record (ms)
    pub average_latency_ms: f64,
    /// Messages routed per second of cumulative node uptime
    pub throughput: f64,
    /// delivered / (delivered + failed), 1.0 with no outcomes yet
    pub reliability: f64,
}

impl NetworkStatistics {
    pub fn compute(network: &Network) -> Self {
        let registry = network.registry();
        let router = network.router();

        let mut connection_records = 0usize;
        let mut latency_sum = 0u64;
        let mut routed = 0u64;
        let mut uptime_ms = 0u64;
        for node in registry.iter() {
            connection_records += node.connections.len();
            latency_sum += node.connections.iter().map(|c| c.latency_ms as u64).sum::<u64>();
            routed += node.metrics.messages_routed;
            uptime_ms += node.metrics.uptime_ms;
        }

        let delivered = router.count_in_state(DeliveryState::Delivered);
        let failed = router.count_in_state(DeliveryState::Failed);
        let outcomes = delivered + failed;

        Self {
            total_nodes: registry.len(),
            active_nodes: registry
                .iter()
                .filter(|n| n.status == NodeStatus::Active)
                .count(),
            total_messages: router.message_count(),
            delivered_messages: delivered,
            failed_messages: failed,
            queued_messages: network.queue().total_count(),
            total_connections: connection_records / 2,
            average_hop_count: router.average_hop_count(),
            network_diameter: network.routes().diameter(),
            average_latency_ms: if connection_records == 0 {
                0.0
            } else {
                latency_sum as f64 / connection_records as f64
            },
            throughput: if uptime_ms == 0 {
                0.0
            } else {
                routed as f64 / (uptime_ms as f64 / 1000.0)
            },
            reliability: if outcomes == 0 {
                1.0
            } else {
                delivered as f64 / outcomes as f64
            },
        }
    }
}
