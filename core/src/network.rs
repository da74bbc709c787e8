// Network — the aggregate root shared by every component
//
// One `Network` lives behind a single mutex in the service. Every method
// here is synchronous and returns the events it produced so the caller
// can publish them after releasing the lock.

use crate::config::NetworkConfig;
use crate::events::MeshEvent;
use crate::message::{encode_frame, EncryptionInfo, Message, MessageType, Payload, Priority, RoutingAlgorithm};
use crate::node::{GeoLocation, Node, NodeCapabilities, NodeId, NodeRegistry, NodeStatus};
use crate::routing::{DeliveryState, MessageRouter, RoutingTable};
use crate::store::{QueuedMessage, StoreAndForwardQueue};
use crate::transport::connection::{self, Connection};
use crate::transport::{LinkMetrics, LinkType};
use crate::{MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyNode {
    pub id: NodeId,
    pub name: String,
    pub status: NodeStatus,
    pub location: GeoLocation,
    pub relay_capable: bool,
    pub connection_count: usize,
}

/// One undirected link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub link_type: LinkType,
    pub latency_ms: u32,
    pub signal_strength_dbm: i32,
    pub bandwidth_kbps: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkTopology {
    pub nodes: Vec<TopologyNode>,
    pub edges: Vec<TopologyEdge>,
}

/// What `remove_node` tore down
#[derive(Debug, Default)]
pub struct Departure {
    pub former_peers: Vec<NodeId>,
    pub dropped: Vec<QueuedMessage>,
    pub events: Vec<MeshEvent>,
}

pub struct Network {
    pub(crate) config: NetworkConfig,
    pub(crate) registry: NodeRegistry,
    pub(crate) routes: RoutingTable,
    pub(crate) router: MessageRouter,
    pub(crate) queue: StoreAndForwardQueue,
    pub(crate) local_node_id: Option<NodeId>,
}

impl Network {
    pub fn new(config: NetworkConfig) -> MeshResult<Self> {
        config.validate()?;
        Ok(Self {
            registry: NodeRegistry::new(config.max_nodes),
            routes: RoutingTable::new(),
            router: MessageRouter::new(config.max_seen_ids),
            queue: StoreAndForwardQueue::new(&config.queue),
            local_node_id: None,
            config,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn queue(&self) -> &StoreAndForwardQueue {
        &self.queue
    }

    pub fn local_node_id(&self) -> Option<&NodeId> {
        self.local_node_id.as_ref()
    }

    pub fn require_local(&self) -> MeshResult<NodeId> {
        self.local_node_id
            .clone()
            .ok_or(MeshError::LocalNodeNotInitialized)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Register a node in `Connecting`. The first node becomes the local node.
    pub fn add_node(
        &mut self,
        device_id: String,
        name: String,
        capabilities: NodeCapabilities,
        location: GeoLocation,
        now: u64,
    ) -> MeshResult<(NodeId, Vec<MeshEvent>)> {
        let node = Node::new(device_id, name.clone(), capabilities, location, now);
        let id = self.registry.register(node)?;

        if self.local_node_id.is_none() {
            info!("Local node is {} ({})", name, id);
            self.local_node_id = Some(id.clone());
        }

        Ok((
            id.clone(),
            vec![MeshEvent::NodeJoined { node_id: id, name }],
        ))
    }

    /// Set a node's status, reporting the transition as an event
    pub fn set_status(&mut self, node_id: &str, status: NodeStatus) -> MeshResult<Vec<MeshEvent>> {
        Ok(self
            .registry
            .set_status(node_id, status)?
            .map(|from| MeshEvent::NetworkStatusChanged {
                node_id: node_id.to_string(),
                from,
                to: status,
            })
            .into_iter()
            .collect())
    }

    /// Tear a node out of the mesh. `None` if it was not registered.
    pub fn remove_node(&mut self, node_id: &str) -> Option<Departure> {
        if !self.registry.contains(node_id) {
            return None;
        }

        let former_peers = connection::sever_all(&mut self.registry, node_id);
        let dropped = self.queue.remove_node(node_id);
        for entry in &dropped {
            self.router.set_state(&entry.message.id, DeliveryState::Failed);
        }
        self.router.forget_node(node_id);
        self.registry.remove(node_id);
        self.routes.rebuild(&self.registry);

        if self.local_node_id.as_deref() == Some(node_id) {
            self.local_node_id = None;
        }

        let mut events: Vec<MeshEvent> = former_peers
            .iter()
            .map(|peer| MeshEvent::ConnectionLost {
                from: node_id.to_string(),
                to: peer.clone(),
            })
            .collect();
        for peer in &former_peers {
            events.extend(self.settle_link_status(peer));
        }
        events.push(MeshEvent::NodeLeft {
            node_id: node_id.to_string(),
        });

        info!(
            "Node {} left ({} links, {} queued messages dropped)",
            node_id,
            former_peers.len(),
            dropped.len()
        );
        Some(Departure {
            former_peers,
            dropped,
            events,
        })
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Commit a link the transport has opened
    pub fn commit_connection(
        &mut self,
        from: &str,
        to: &str,
        link: LinkType,
        metrics: LinkMetrics,
        now: u64,
    ) -> MeshResult<(Connection, Vec<MeshEvent>)> {
        let (conn, created) = connection::establish(&mut self.registry, from, to, link, metrics, now)?;
        if !created {
            return Ok((conn, Vec::new()));
        }

        self.routes.rebuild(&self.registry);
        let mut events = vec![MeshEvent::ConnectionEstablished {
            from: from.to_string(),
            to: to.to_string(),
            link_type: link,
        }];
        events.extend(self.settle_link_status(from));
        events.extend(self.settle_link_status(to));
        Ok((conn, events))
    }

    /// Remove a link if present
    pub fn disconnect(&mut self, from: &str, to: &str) -> Vec<MeshEvent> {
        if !connection::sever(&mut self.registry, from, to) {
            return Vec::new();
        }
        self.routes.rebuild(&self.registry);
        let mut events = vec![MeshEvent::ConnectionLost {
            from: from.to_string(),
            to: to.to_string(),
        }];
        events.extend(self.settle_link_status(from));
        events.extend(self.settle_link_status(to));
        events
    }

    /// Refresh the measured quality of an existing link, both directions
    pub fn refresh_link(&mut self, from: &str, to: &str, metrics: LinkMetrics, now: u64) -> bool {
        let mut refreshed = false;
        for (a, b) in [(from, to), (to, from)] {
            if let Some(conn) = self
                .registry
                .get_mut(a)
                .and_then(|node| node.connection_to_mut(b))
            {
                conn.latency_ms = metrics.latency_ms;
                conn.signal_strength_dbm = metrics.signal_strength_dbm;
                conn.last_activity = now;
                refreshed = true;
            }
        }
        if refreshed {
            self.registry.touch(to, now);
        }
        refreshed
    }

    /// Active and Inactive nodes with no links left become Disconnected;
    /// a Disconnected node that gains a link is Active again.
    fn settle_link_status(&mut self, node_id: &str) -> Vec<MeshEvent> {
        let Some(node) = self.registry.get(node_id) else {
            return Vec::new();
        };
        let next = match node.status {
            NodeStatus::Active | NodeStatus::Inactive if node.connections.is_empty() => {
                NodeStatus::Disconnected
            }
            NodeStatus::Disconnected if !node.connections.is_empty() => NodeStatus::Active,
            _ => return Vec::new(),
        };
        self.set_status(node_id, next).unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Build, validate and record a message originating at `source`
    #[allow(clippy::too_many_arguments)]
    pub fn originate(
        &mut self,
        source: &str,
        destination: &str,
        message_type: MessageType,
        priority: Priority,
        payload: Payload,
        max_hops: u32,
        encrypted: bool,
        now: u64,
    ) -> MeshResult<Message> {
        self.registry.require(source)?;
        if payload.size > self.config.max_message_size {
            return Err(MeshError::MessageTooLarge {
                size: payload.size,
                max: self.config.max_message_size,
            });
        }

        let mut msg = Message::new(
            source.to_string(),
            destination.to_string(),
            message_type,
            priority,
            payload,
            max_hops,
            self.config.message_ttl_secs,
            now,
        );
        if !msg.is_broadcast() {
            msg.routing.algorithm = self.config.routing_algorithm;
            if msg.routing.algorithm == RoutingAlgorithm::ShortestPath {
                msg.routing.path = Self::known_path(&self.registry, &self.routes, source, destination);
            }
        }
        if encrypted && self.config.enable_encryption {
            msg.encryption = EncryptionInfo::aes_gcm(format!("key-{}", source));
        }
        msg.payload.compressed = self.config.enable_compression;
        // Uncompressed is the worst case a hop will emit
        encode_frame(&msg, false)?;

        if !message_type.is_control() {
            if let Some(node) = self.registry.get_mut(source) {
                node.metrics.messages_originated += 1;
            }
        }
        self.router.record(&msg);
        self.router.mark_seen(source, &msg.id);
        Ok(msg)
    }

    fn known_path(
        registry: &NodeRegistry,
        routes: &RoutingTable,
        from: &str,
        to: &str,
    ) -> Option<Vec<NodeId>> {
        let node = registry.get(from)?;
        if node.is_connected_to(to) {
            Some(vec![to.to_string()])
        } else {
            routes.path(from, to).map(|p| p.to_vec())
        }
    }

    /// Hand a unicast to the store-and-forward queue at `custodian`.
    ///
    /// Returns false (and marks the message failed) when the queue refuses it.
    pub fn take_custody(&mut self, msg: Message, custodian: &str, now: u64) -> bool {
        let id = msg.id.clone();
        if !self.registry.contains(custodian) {
            warn!("Cannot queue message {}: custodian {} has left", id, custodian);
            self.router.set_state(&id, DeliveryState::Failed);
            return false;
        }
        match self
            .queue
            .enqueue(QueuedMessage::new(msg, custodian.to_string(), now))
        {
            Ok(_) => {
                self.router.set_state(&id, DeliveryState::Queued);
                true
            }
            Err(e) => {
                warn!("Cannot queue message {}: {}", id, e);
                self.router.set_state(&id, DeliveryState::Failed);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Liveness and views
    // ------------------------------------------------------------------

    pub fn sweep_liveness(&mut self, now: u64) -> Vec<MeshEvent> {
        let inactive_after = self.config.inactive_after_ms();
        let unreachable_after = self.config.unreachable_after_ms();
        self.registry
            .sweep_liveness(now, inactive_after, unreachable_after)
            .into_iter()
            .map(|change| MeshEvent::NetworkStatusChanged {
                node_id: change.node_id,
                from: change.from,
                to: change.to,
            })
            .collect()
    }

    /// Nodes plus one edge per link
    pub fn topology(&self) -> NetworkTopology {
        let mut topology = NetworkTopology::default();
        let mut emitted: HashSet<(&str, &str)> = HashSet::new();

        for node in self.registry.iter() {
            topology.nodes.push(TopologyNode {
                id: node.id.clone(),
                name: node.name.clone(),
                status: node.status,
                location: node.location,
                relay_capable: node.capabilities.relay_capable,
                connection_count: node.connections.len(),
            });

            for conn in &node.connections {
                if emitted.contains(&(conn.peer_id.as_str(), node.id.as_str())) {
                    continue;
                }
                emitted.insert((node.id.as_str(), conn.peer_id.as_str()));
                topology.edges.push(TopologyEdge {
                    source: node.id.clone(),
                    target: conn.peer_id.clone(),
                    link_type: conn.link_type,
                    latency_ms: conn.latency_ms,
                    signal_strength_dbm: conn.signal_strength_dbm,
                    bandwidth_kbps: conn.bandwidth_kbps,
                });
            }
        }

        topology
    }
}
