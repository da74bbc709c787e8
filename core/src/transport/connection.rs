//! Connection Manager — symmetric links between registered nodes
//!
//! A link is two `Connection` records, one on each endpoint, always created
//! and removed together. Opening a link is split in two so the transport
//! call can happen without holding the network lock:
//! `plan_connection` validates, the caller talks to the transport, then
//! `establish` commits both records (re-validating in case topology moved).

use super::abstraction::{LinkMetrics, LinkType};
use crate::node::{NodeId, NodeRegistry};
use crate::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One direction of a link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub peer_id: NodeId,
    pub peer_name: String,
    pub link_type: LinkType,
    pub signal_strength_dbm: i32,
    pub latency_ms: u32,
    /// min(local, peer) bandwidth
    pub bandwidth_kbps: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_transferred: u64,
    pub established_at: u64,
    pub last_activity: u64,
}

/// Outcome of validating a connection request
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectPlan {
    /// The pair is already linked
    Existing(Connection),
    /// Ask the transport to open a link
    Open {
        link_type: LinkType,
        bandwidth_kbps: u32,
    },
}

/// Validate a connection request against both endpoints
pub fn plan_connection(
    registry: &NodeRegistry,
    from: &str,
    to: &str,
    link: LinkType,
) -> MeshResult<ConnectPlan> {
    let local = registry.require(from)?;
    let peer = registry.require(to)?;

    if from == to {
        return Err(MeshError::ConnectionFailed(format!(
            "node {} cannot link to itself",
            from
        )));
    }

    if let Some(existing) = local.connection_to(to) {
        return Ok(ConnectPlan::Existing(existing.clone()));
    }

    if !local.capabilities.supports(link) || !peer.capabilities.supports(link) {
        return Err(MeshError::IncompatibleLinkType {
            from: from.to_string(),
            to: to.to_string(),
            link,
        });
    }

    if !local.has_capacity() {
        return Err(MeshError::ConnectionLimitReached(from.to_string()));
    }
    if !peer.has_capacity() {
        return Err(MeshError::ConnectionLimitReached(to.to_string()));
    }

    Ok(ConnectPlan::Open {
        link_type: link,
        bandwidth_kbps: local
            .capabilities
            .bandwidth_kbps
            .min(peer.capabilities.bandwidth_kbps),
    })
}

/// Commit a link: mirror records on both endpoints.
///
/// Returns the record on `from` and whether it was newly created.
pub fn establish(
    registry: &mut NodeRegistry,
    from: &str,
    to: &str,
    link: LinkType,
    metrics: LinkMetrics,
    now: u64,
) -> MeshResult<(Connection, bool)> {
    let bandwidth_kbps = match plan_connection(registry, from, to, link)? {
        ConnectPlan::Existing(existing) => return Ok((existing, false)),
        ConnectPlan::Open { bandwidth_kbps, .. } => bandwidth_kbps,
    };

    let from_name = registry.require(from)?.name.clone();
    let to_name = registry.require(to)?.name.clone();

    let record = |peer_id: &str, peer_name: String| Connection {
        peer_id: peer_id.to_string(),
        peer_name,
        link_type: link,
        signal_strength_dbm: metrics.signal_strength_dbm,
        latency_ms: metrics.latency_ms,
        bandwidth_kbps,
        messages_sent: 0,
        messages_received: 0,
        bytes_transferred: 0,
        established_at: now,
        last_activity: now,
    };

    let forward = record(to, to_name);
    let local = registry.require_mut(from)?;
    local.connections.push(forward.clone());
    local.refresh_average_latency();

    let peer = registry.require_mut(to)?;
    peer.connections.push(record(from, from_name));
    peer.refresh_average_latency();

    debug!("Link {} <-> {} established over {}", from, to, link);
    Ok((forward, true))
}

/// Remove both records of a link. Returns true if a link existed.
pub fn sever(registry: &mut NodeRegistry, a: &str, b: &str) -> bool {
    let mut removed = false;

    if let Some(node) = registry.get_mut(a) {
        let before = node.connections.len();
        node.connections.retain(|c| c.peer_id != b);
        removed |= node.connections.len() != before;
        node.refresh_average_latency();
    }
    if let Some(node) = registry.get_mut(b) {
        let before = node.connections.len();
        node.connections.retain(|c| c.peer_id != a);
        removed |= node.connections.len() != before;
        node.refresh_average_latency();
    }

    if removed {
        debug!("Link {} <-> {} severed", a, b);
    }
    removed
}

/// Remove every link of a node. Returns the former peers in link order.
pub fn sever_all(registry: &mut NodeRegistry, node_id: &str) -> Vec<NodeId> {
    let peers: Vec<NodeId> = match registry.get(node_id) {
        Some(node) => node.peer_ids().cloned().collect(),
        None => return Vec::new(),
    };

    for peer in &peers {
        sever(registry, node_id, peer);
    }
    peers
}

/// Record a connection attempt on the initiating node
pub fn record_attempt(registry: &mut NodeRegistry, node_id: &str, succeeded: bool) {
    if let Some(node) = registry.get_mut(node_id) {
        node.metrics.connection_attempts += 1;
        if !succeeded {
            node.metrics.connection_failures += 1;
        }
    }
}

/// Update link counters after a frame crossed `from -> to`
pub fn record_transfer(registry: &mut NodeRegistry, from: &str, to: &str, bytes: usize, now: u64) {
    if let Some(conn) = registry.get_mut(from).and_then(|n| n.connection_to_mut(to)) {
        conn.messages_sent += 1;
        conn.bytes_transferred += bytes as u64;
        conn.last_activity = now;
    }
    if let Some(conn) = registry.get_mut(to).and_then(|n| n.connection_to_mut(from)) {
        conn.messages_received += 1;
        conn.bytes_transferred += bytes as u64;
        conn.last_activity = now;
    }
}
