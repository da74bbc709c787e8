// Heartbeat — periodic one-hop status beacons
//
// A beat accrues uptime, restores the sender to Active (a Disconnected
// sender with no links stays Disconnected), runs the liveness
// sweep over the whole registry, then floods a Low priority Heartbeat to
// direct neighbors only.

use super::{delivery, Shared};
use crate::events::MeshEvent;
use crate::message::{Message, MessageType, Payload, Priority, BROADCAST_DESTINATION};
use crate::network::Network;
use crate::node::{GeoLocation, NodeStatus};
use crate::{current_timestamp, MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// JSON body of a heartbeat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStatus {
    pub status: NodeStatus,
    pub location: GeoLocation,
    pub battery_level: Option<u8>,
    pub connection_count: usize,
}

impl HeartbeatStatus {
    pub fn parse(msg: &Message) -> MeshResult<Self> {
        serde_json::from_str(&msg.payload.content).map_err(|e| MeshError::Codec(e.to_string()))
    }
}

/// Local bookkeeping for one beat. Returns the message to flood and the
/// status changes it caused.
pub(crate) fn prepare_beat(
    network: &mut Network,
    node_id: &str,
    now: u64,
) -> MeshResult<(Message, Vec<MeshEvent>)> {
    let interval_ms = network.config().heartbeat_interval_ms;
    {
        let node = network.registry.require_mut(node_id)?;
        node.metrics.uptime_ms += interval_ms;
    }
    network.registry.touch(node_id, now);

    let node = network.registry.require(node_id)?;
    let alive = if node.status == NodeStatus::Disconnected && node.connections.is_empty() {
        NodeStatus::Disconnected
    } else {
        NodeStatus::Active
    };
    let mut events = network.set_status(node_id, alive)?;
    events.extend(network.sweep_liveness(now));

    let node = network.registry.require(node_id)?;
    let status = HeartbeatStatus {
        status: node.status,
        location: node.location,
        battery_level: node.capabilities.battery_level,
        connection_count: node.connections.len(),
    };
    let body = serde_json::to_string(&status).map_err(|e| MeshError::Codec(e.to_string()))?;

    let msg = network.originate(
        node_id,
        BROADCAST_DESTINATION,
        MessageType::Heartbeat,
        Priority::Low,
        Payload::json(body),
        1,
        false,
        now,
    )?;
    Ok((msg, events))
}

/// Run one heartbeat for `node_id`. Returns how many neighbors heard it.
pub(crate) async fn beat(shared: &Shared, node_id: &str) -> MeshResult<usize> {
    let _dispatch = shared.dispatch.lock().await;

    let (msg, events) = {
        let mut network = shared.network.lock();
        prepare_beat(&mut network, node_id, current_timestamp())?
    };
    shared.events.publish_all(events);

    let reached = delivery::flood(shared, msg).await;
    debug!("Heartbeat from {} reached {} neighbors", node_id, reached);
    Ok(reached)
}
