//! Message router — per-message state and per-hop decisions
//!
//! The router is synchronous: it decides who a node transmits to and what
//! a node does with a message it receives. Moving frames over the
//! transport is left to the async delivery driver, which calls back into
//! the router between transmissions.
//!
//! Loop prevention for floods relies solely on the per-node seen caches.

use super::table::RoutingTable;
use crate::events::MeshEvent;
use crate::message::{Acknowledgment, Message, MessageId};
use crate::node::{NodeId, NodeRegistry};
use crate::store::SeenCache;
use crate::transport::LinkType;
use std::collections::HashMap;
use tracing::debug;

/// Where a message stands from its originator's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    /// Reached its destination (or, for a broadcast, at least one node)
    Delivered,
    /// In store-and-forward custody
    Queued,
    Failed,
}

/// One transmission the delivery driver should attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub to: NodeId,
    pub link_type: LinkType,
}

/// A flood step: the copy a node sends and who it goes to
#[derive(Debug, Clone)]
pub struct FloodStep {
    pub copy: Message,
    pub targets: Vec<Transmission>,
}

/// What a receiver did with a flooded message
#[derive(Debug, Default)]
pub struct Reception {
    /// First sighting at this node
    pub accepted: bool,
    /// The receiver will flood the message onward
    pub relay: bool,
    pub events: Vec<MeshEvent>,
}

/// Why a unicast hop could not be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopBlocked {
    Expired,
    /// The link to the next hop is gone
    LinkDown,
    NodeGone,
}

#[derive(Debug)]
pub struct MessageRouter {
    /// Application messages by id (control traffic is never recorded)
    messages: HashMap<MessageId, Message>,
    order: Vec<MessageId>,
    states: HashMap<MessageId, DeliveryState>,
    seen: HashMap<NodeId, SeenCache>,
    seen_capacity: usize,
}

impl MessageRouter {
    pub fn new(seen_capacity: usize) -> Self {
        Self {
            messages: HashMap::new(),
            order: Vec::new(),
            states: HashMap::new(),
            seen: HashMap::new(),
            seen_capacity,
        }
    }

    // ------------------------------------------------------------------
    // Message records
    // ------------------------------------------------------------------

    /// Record a freshly originated message
    pub fn record(&mut self, msg: &Message) {
        if msg.message_type.is_control() || self.messages.contains_key(&msg.id) {
            return;
        }
        self.messages.insert(msg.id.clone(), msg.clone());
        self.order.push(msg.id.clone());
        self.states.insert(msg.id.clone(), DeliveryState::Pending);
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Recorded messages in origination order
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.order.iter().filter_map(|id| self.messages.get(id))
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn state(&self, id: &str) -> Option<DeliveryState> {
        self.states.get(id).copied()
    }

    /// Update a message's state. Delivered is final.
    pub fn set_state(&mut self, id: &str, state: DeliveryState) {
        if let Some(current) = self.states.get_mut(id) {
            if *current != DeliveryState::Delivered {
                *current = state;
            }
        }
    }

    pub fn count_in_state(&self, state: DeliveryState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }

    /// Mean hop count over recorded messages that travelled at least one hop
    pub fn average_hop_count(&self) -> f64 {
        let travelled: Vec<usize> = self
            .messages
            .values()
            .map(|m| m.hop_count())
            .filter(|h| *h > 0)
            .collect();
        if travelled.is_empty() {
            0.0
        } else {
            travelled.iter().sum::<usize>() as f64 / travelled.len() as f64
        }
    }

    fn acknowledge(&mut self, msg: &Message, node_id: &str, relayed: bool, now: u64) {
        let Some(record) = self.messages.get_mut(&msg.id) else {
            return;
        };
        if record.acknowledgment_from(node_id).is_none() {
            record.acknowledgments.push(Acknowledgment {
                node_id: node_id.to_string(),
                timestamp: now,
                received: true,
                relayed,
            });
        }
        if msg.routing.hops.len() > record.routing.hops.len() {
            record.routing.hops = msg.routing.hops.clone();
        }
    }

    // ------------------------------------------------------------------
    // Seen caches
    // ------------------------------------------------------------------

    /// Mark a message as seen by a node. Returns false if it already was.
    pub fn mark_seen(&mut self, node_id: &str, message_id: &str) -> bool {
        let capacity = self.seen_capacity;
        self.seen
            .entry(node_id.to_string())
            .or_insert_with(|| SeenCache::new(capacity))
            .insert(message_id)
    }

    pub fn has_seen(&self, node_id: &str, message_id: &str) -> bool {
        self.seen
            .get(node_id)
            .map_or(false, |s| s.contains(message_id))
    }

    pub fn forget_node(&mut self, node_id: &str) {
        self.seen.remove(node_id);
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    fn flood_targets(registry: &NodeRegistry, node_id: &str, msg: &Message) -> Vec<Transmission> {
        registry
            .get(node_id)
            .map(|node| {
                node.connections
                    .iter()
                    .filter(|c| !msg.visited(&c.peer_id))
                    .map(|c| Transmission {
                        to: c.peer_id.clone(),
                        link_type: c.link_type,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `node_id`, now holding `msg`, may flood it onward
    pub fn should_relay(registry: &NodeRegistry, node_id: &str, msg: &Message, now: u64) -> bool {
        let Some(node) = registry.get(node_id) else {
            return false;
        };
        let originator = msg.source_id == node_id && msg.routing.hops.is_empty();
        (originator || node.capabilities.relay_capable)
            && !msg.is_expired(now)
            && msg.has_hop_budget()
            && !Self::flood_targets(registry, node_id, msg).is_empty()
    }

    /// Prepare `node_id`'s transmission of a flooded message, or `None` when
    /// the flood stops here.
    pub fn plan_flood(
        &mut self,
        registry: &mut NodeRegistry,
        node_id: &str,
        msg: &Message,
        now: u64,
    ) -> Option<FloodStep> {
        if !Self::should_relay(registry, node_id, msg, now) {
            return None;
        }

        let targets = Self::flood_targets(registry, node_id, msg);
        let mut copy = msg.clone();
        copy.push_hop(node_id, now);

        if msg.source_id != node_id {
            if let Some(node) = registry.get_mut(node_id) {
                node.metrics.messages_routed += 1;
            }
        }

        Some(FloodStep { copy, targets })
    }

    /// Handle a flooded message arriving at `receiver` from `from`
    pub fn accept_broadcast(
        &mut self,
        registry: &mut NodeRegistry,
        receiver: &str,
        from: &str,
        msg: &Message,
        now: u64,
    ) -> Reception {
        if !self.mark_seen(receiver, &msg.id) {
            debug!("Node {} drops duplicate {}", receiver, msg.id);
            return Reception::default();
        }

        let relay = Self::should_relay(registry, receiver, msg, now);

        if msg.message_type.is_control() {
            registry.touch(from, now);
            return Reception {
                accepted: true,
                relay,
                events: Vec::new(),
            };
        }

        self.acknowledge(msg, receiver, relay, now);
        Reception {
            accepted: true,
            relay,
            events: vec![MeshEvent::MessageReceived {
                node_id: receiver.to_string(),
                from: from.to_string(),
                message: msg.clone(),
            }],
        }
    }

    // ------------------------------------------------------------------
    // Unicast
    // ------------------------------------------------------------------

    /// Path from `from` to the message's destination, ending with it.
    ///
    /// A direct link wins without consulting the table. Paths that would
    /// exceed the hop budget count as no route.
    pub fn plan_unicast(
        registry: &NodeRegistry,
        routes: &RoutingTable,
        from: &str,
        msg: &Message,
    ) -> Option<Vec<NodeId>> {
        let dest = msg.destination_id.as_str();
        let node = registry.get(from)?;

        let path = if node.is_connected_to(dest) {
            vec![dest.to_string()]
        } else {
            routes.path(from, dest)?.to_vec()
        };

        if msg.routing.hops.len() + path.len() > msg.routing.max_hops as usize {
            debug!(
                "Path {} -> {} needs {} hops, budget {}",
                from,
                dest,
                path.len(),
                msg.routing.max_hops
            );
            return None;
        }
        Some(path)
    }

    /// Prepare one unicast hop `current -> next`, attaching the rest of the path
    pub fn prepare_hop(
        registry: &mut NodeRegistry,
        current: &str,
        next: &str,
        remaining: &[NodeId],
        msg: &Message,
        now: u64,
    ) -> Result<(Message, LinkType), HopBlocked> {
        if msg.is_expired(now) {
            return Err(HopBlocked::Expired);
        }
        let node = registry.get_mut(current).ok_or(HopBlocked::NodeGone)?;
        let link_type = node
            .connection_to(next)
            .map(|c| c.link_type)
            .ok_or(HopBlocked::LinkDown)?;

        if msg.source_id != current {
            node.metrics.messages_routed += 1;
        }

        let mut copy = msg.clone();
        copy.push_hop(current, now);
        copy.routing.path = Some(remaining.to_vec());
        Ok((copy, link_type))
    }

    /// Handle a unicast arriving at its destination
    pub fn deliver_unicast(&mut self, receiver: &str, from: &str, msg: &Message, now: u64) -> Vec<MeshEvent> {
        if !self.mark_seen(receiver, &msg.id) {
            return Vec::new();
        }

        self.acknowledge(msg, receiver, false, now);
        self.set_state(&msg.id, DeliveryState::Delivered);
        debug!("Message {} delivered to {} in {} hops", msg.id, receiver, msg.hop_count());

        vec![
            MeshEvent::MessageReceived {
                node_id: receiver.to_string(),
                from: from.to_string(),
                message: msg.clone(),
            },
            MeshEvent::MessageDelivered {
                message_id: msg.id.clone(),
                destination_id: receiver.to_string(),
                hops: msg.hop_count(),
            },
        ]
    }
}
