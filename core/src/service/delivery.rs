// Delivery driver — moves frames between nodes over the transport
//
// The router decides, this module acts: encode, transmit with a timeout,
// decode at the receiver, and hand the result back to the router. The
// network lock is taken only between transport calls.

use super::Shared;
use crate::message::{decode_frame, encode_frame, Message};
use crate::network::Network;
use crate::node::NodeId;
use crate::routing::{DeliveryState, HopBlocked, MessageRouter};
use crate::store::RetryDecision;
use crate::transport::connection;
use crate::transport::LinkType;
use crate::{current_timestamp, MeshError, MeshResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// How a send ended, from the originator's point of view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The unicast reached its destination
    Delivered { hops: usize },
    /// The flood was accepted by this many nodes
    Broadcast { reached: usize },
    /// Held in store-and-forward custody
    Queued,
    Failed,
}

/// Summary of one store-and-forward pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub dropped: usize,
}

/// End of a unicast walk along a path
#[derive(Debug)]
pub(crate) enum Walk {
    Delivered { hops: usize },
    /// Stopped at `custodian`, which still holds `message`
    Stalled { custodian: NodeId, message: Message },
    /// Expired or unencodable; cannot make progress anywhere
    Dead,
}

fn encode(shared: &Shared, msg: &Message) -> Option<Vec<u8>> {
    match encode_frame(msg, shared.config.enable_compression) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Cannot encode message {}: {}", msg.id, e);
            None
        }
    }
}

/// Push one frame over the transport, bounded by the transmit timeout
async fn transmit(shared: &Shared, from: &str, to: &str, link: LinkType, frame: &[u8]) -> bool {
    let timeout = shared.config.transmit_timeout();
    let delivered = match tokio::time::timeout(timeout, shared.transport.send(from, to, link, frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Frame {} -> {} lost: {}", from, to, e);
            false
        }
        Err(_) => {
            warn!("Frame {} -> {} timed out after {:?}", from, to, timeout);
            false
        }
    };

    let mut network = shared.network.lock();
    if let Some(node) = network.registry.get_mut(from) {
        node.metrics.record_frame(delivered);
    }
    delivered
}

/// Counters for a frame that crossed `from -> to`
fn note_transfer(network: &mut Network, from: &str, to: &str, msg: &Message, bytes: usize, now: u64) {
    connection::record_transfer(&mut network.registry, from, to, bytes, now);
    if msg.source_id != from {
        if let Some(node) = network.registry.get_mut(from) {
            node.metrics.bytes_relayed += bytes as u64;
        }
    }
}

fn link_up(shared: &Shared, from: &str, to: &str) -> bool {
    shared
        .network
        .lock()
        .registry
        .get(from)
        .map_or(false, |n| n.is_connected_to(to))
}

/// Flood a message from its source. Returns how many nodes accepted it.
pub(crate) async fn flood(shared: &Shared, msg: Message) -> usize {
    let mut reached = 0;
    let mut wave: VecDeque<(NodeId, Message)> = VecDeque::new();
    wave.push_back((msg.source_id.clone(), msg));

    while let Some((sender, held)) = wave.pop_front() {
        let step = {
            let mut guard = shared.network.lock();
            let network = &mut *guard;
            network
                .router
                .plan_flood(&mut network.registry, &sender, &held, current_timestamp())
        };
        let Some(step) = step else {
            continue;
        };
        let Some(frame) = encode(shared, &step.copy) else {
            continue;
        };

        for target in step.targets {
            if !link_up(shared, &sender, &target.to) {
                continue;
            }
            if !transmit(shared, &sender, &target.to, target.link_type, &frame).await {
                continue;
            }
            let received = match decode_frame(&frame) {
                Ok(received) => received,
                Err(e) => {
                    warn!("Node {} dropped corrupt frame: {}", target.to, e);
                    continue;
                }
            };

            let reception = {
                let mut guard = shared.network.lock();
                let network = &mut *guard;
                if !network.registry.contains(&target.to) {
                    debug!("Node {} left before {} arrived", target.to, received.id);
                    continue;
                }
                let now = current_timestamp();
                note_transfer(network, &sender, &target.to, &received, frame.len(), now);
                network
                    .router
                    .accept_broadcast(&mut network.registry, &target.to, &sender, &received, now)
            };
            shared.events.publish_all(reception.events);

            if reception.accepted {
                reached += 1;
            }
            if reception.relay {
                wave.push_back((target.to, received));
            }
        }
    }

    reached
}

/// Carry a unicast from `custodian` along `path`, one hop at a time
pub(crate) async fn walk(shared: &Shared, custodian: NodeId, msg: Message, path: Vec<NodeId>) -> Walk {
    let mut current = custodian;
    let mut held = msg;

    for (i, next) in path.iter().enumerate() {
        let prepared = {
            let mut network = shared.network.lock();
            MessageRouter::prepare_hop(
                &mut network.registry,
                &current,
                next,
                &path[i + 1..],
                &held,
                current_timestamp(),
            )
        };
        let (copy, link_type) = match prepared {
            Ok(prepared) => prepared,
            Err(HopBlocked::Expired) => {
                debug!("Message {} expired at {}", held.id, current);
                return Walk::Dead;
            }
            Err(reason) => {
                debug!("Message {} blocked at {}: {:?}", held.id, current, reason);
                return Walk::Stalled {
                    custodian: current,
                    message: held,
                };
            }
        };

        let Some(frame) = encode(shared, &copy) else {
            return Walk::Dead;
        };
        if !transmit(shared, &current, next, link_type, &frame).await {
            return Walk::Stalled {
                custodian: current,
                message: held,
            };
        }
        let received = match decode_frame(&frame) {
            Ok(received) => received,
            Err(e) => {
                warn!("Node {} dropped corrupt frame: {}", next, e);
                return Walk::Stalled {
                    custodian: current,
                    message: held,
                };
            }
        };

        let events = {
            let mut network = shared.network.lock();
            if !network.registry.contains(next) {
                debug!("Node {} left before {} arrived", next, received.id);
                if *next == received.destination_id {
                    return Walk::Dead;
                }
                return Walk::Stalled {
                    custodian: current,
                    message: held,
                };
            }
            let now = current_timestamp();
            note_transfer(&mut network, &current, next, &received, frame.len(), now);
            if *next == received.destination_id {
                Some(network.router.deliver_unicast(next, &current, &received, now))
            } else {
                network.router.mark_seen(next, &received.id);
                None
            }
        };

        if let Some(events) = events {
            shared.events.publish_all(events);
            return Walk::Delivered {
                hops: received.hop_count(),
            };
        }

        current = next.clone();
        held = received;
    }

    Walk::Stalled {
        custodian: current,
        message: held,
    }
}

/// Dispatch a freshly originated message
pub(crate) async fn dispatch(shared: &Shared, msg: Message) -> MeshResult<DeliveryOutcome> {
    let id = msg.id.clone();

    if msg.is_broadcast() {
        let reached = flood(shared, msg).await;
        let state = if reached > 0 {
            DeliveryState::Delivered
        } else {
            DeliveryState::Failed
        };
        shared.network.lock().router.set_state(&id, state);
        return Ok(DeliveryOutcome::Broadcast { reached });
    }

    let source = msg.source_id.clone();
    let path = {
        let network = shared.network.lock();
        MessageRouter::plan_unicast(&network.registry, &network.routes, &source, &msg)
    };

    let Some(path) = path else {
        let mut network = shared.network.lock();
        if shared.config.store_and_forward {
            let queued = network.take_custody(msg, &source, current_timestamp());
            return Ok(if queued {
                DeliveryOutcome::Queued
            } else {
                DeliveryOutcome::Failed
            });
        }
        network.router.set_state(&id, DeliveryState::Failed);
        return Err(MeshError::NoRouteFound(msg.destination_id));
    };

    match walk(shared, source, msg, path).await {
        Walk::Delivered { hops } => Ok(DeliveryOutcome::Delivered { hops }),
        Walk::Stalled { custodian, message } => {
            let mut network = shared.network.lock();
            if shared.config.reliable_delivery
                && shared.config.store_and_forward
                && network.take_custody(message, &custodian, current_timestamp())
            {
                Ok(DeliveryOutcome::Queued)
            } else {
                network.router.set_state(&id, DeliveryState::Failed);
                Ok(DeliveryOutcome::Failed)
            }
        }
        Walk::Dead => {
            shared.network.lock().router.set_state(&id, DeliveryState::Failed);
            Ok(DeliveryOutcome::Failed)
        }
    }
}

fn count_failure(shared: &Shared, message_id: &str, report: &mut DrainReport) {
    let mut network = shared.network.lock();
    match network.queue.record_failure(message_id, current_timestamp()) {
        Some(RetryDecision::Rescheduled { .. }) => report.rescheduled += 1,
        Some(RetryDecision::Exhausted(_)) => {
            network.router.set_state(message_id, DeliveryState::Failed);
            report.dropped += 1;
        }
        None => {}
    }
}

/// Retry every due queued message from its custodian
pub(crate) async fn drain(shared: &Shared) -> DrainReport {
    let mut report = DrainReport::default();

    let due = {
        let mut network = shared.network.lock();
        let now = current_timestamp();
        for expired in network.queue.remove_expired(now) {
            debug!("Queued message {} expired", expired.message.id);
            network.router.set_state(&expired.message.id, DeliveryState::Failed);
            report.dropped += 1;
        }
        network.queue.due(now)
    };

    for entry in due {
        let id = entry.message.id.clone();
        let path = {
            let network = shared.network.lock();
            if !network.queue.contains(&id) {
                continue;
            }
            MessageRouter::plan_unicast(
                &network.registry,
                &network.routes,
                &entry.custodian_id,
                &entry.message,
            )
        };
        report.attempted += 1;

        let Some(path) = path else {
            count_failure(shared, &id, &mut report);
            continue;
        };

        match walk(shared, entry.custodian_id, entry.message, path).await {
            Walk::Delivered { .. } => {
                shared.network.lock().queue.remove(&id);
                report.delivered += 1;
            }
            Walk::Stalled { custodian, message } => {
                {
                    let mut network = shared.network.lock();
                    if let Some(queued) = network.queue.get_mut(&id) {
                        queued.custodian_id = custodian;
                        queued.message = message;
                    }
                }
                count_failure(shared, &id, &mut report);
            }
            Walk::Dead => {
                let mut network = shared.network.lock();
                network.queue.remove(&id);
                network.router.set_state(&id, DeliveryState::Failed);
                report.dropped += 1;
            }
        }
    }

    if report.attempted > 0 || report.dropped > 0 {
        debug!(
            "Store-and-forward pass: {} attempted, {} delivered, {} rescheduled, {} dropped",
            report.attempted, report.delivered, report.rescheduled, report.dropped
        );
    }
    report
}
