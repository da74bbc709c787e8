// Mesh service — the public face of the mesh core
//
// Owns the shared network state, the event bus, the transport and the
// per-node schedules. All state lives behind one mutex that is never held
// across an await; a separate async dispatch lock keeps message traffic
// in send order.

pub mod delivery;
pub mod heartbeat;
mod scheduler;

pub use delivery::{DeliveryOutcome, DrainReport};
pub use heartbeat::HeartbeatStatus;

use crate::config::NetworkConfig;
use crate::events::{CallbackError, EventBus, EventKind, MeshEvent, SubscriptionId};
use crate::message::{Message, MessageId, MessageType, Payload, Priority, BROADCAST_DESTINATION};
use crate::network::{Network, NetworkTopology};
use crate::node::{GeoLocation, Node, NodeCapabilities, NodeId, NodeStatus};
use crate::routing::DeliveryState;
use crate::stats::NetworkStatistics;
use crate::store::QueuedMessage;
use crate::transport::connection::{self, ConnectPlan, Connection};
use crate::transport::discovery::{scan_candidates, DiscoveryResult};
use crate::transport::{LinkType, Transport};
use crate::{current_timestamp, MeshError, MeshResult};
use parking_lot::Mutex;
use scheduler::Scheduler;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
}

/// What `send` reports back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub outcome: DeliveryOutcome,
}

/// State shared with the background tasks
pub(crate) struct Shared {
    pub(crate) config: NetworkConfig,
    pub(crate) network: Mutex<Network>,
    pub(crate) events: EventBus,
    pub(crate) transport: Arc<dyn Transport>,
    /// Serialises message dispatch so traffic over a link keeps send order
    pub(crate) dispatch: tokio::sync::Mutex<()>,
}

pub struct MeshService {
    shared: Arc<Shared>,
    scheduler: Scheduler,
    auto_schedule: bool,
    state: Mutex<ServiceState>,
}

impl MeshService {
    /// Service whose nodes run discovery and heartbeats on their own
    pub fn new(config: NetworkConfig, transport: Arc<dyn Transport>) -> MeshResult<Self> {
        Self::build(config, transport, true)
    }

    /// Service without background schedules; the caller drives discovery,
    /// heartbeats and store-and-forward explicitly
    pub fn manual(config: NetworkConfig, transport: Arc<dyn Transport>) -> MeshResult<Self> {
        Self::build(config, transport, false)
    }

    fn build(config: NetworkConfig, transport: Arc<dyn Transport>, auto_schedule: bool) -> MeshResult<Self> {
        let network = Network::new(config.clone())?;
        let events = EventBus::with_channel_capacity(config.event_channel_capacity);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                network: Mutex::new(network),
                events,
                transport,
                dispatch: tokio::sync::Mutex::new(()),
            }),
            scheduler: Scheduler::new(),
            auto_schedule,
            state: Mutex::new(ServiceState::Running),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Register a node and start its schedules. The first node joined
    /// becomes the local node.
    pub fn join(
        &self,
        device_id: &str,
        name: &str,
        capabilities: NodeCapabilities,
        location: GeoLocation,
    ) -> MeshResult<NodeId> {
        let (node_id, mut events) = self.shared.network.lock().add_node(
            device_id.to_string(),
            name.to_string(),
            capabilities,
            location,
            current_timestamp(),
        )?;

        if self.auto_schedule && self.state() == ServiceState::Running {
            self.scheduler.start(&self.shared, &node_id);
        }

        events.extend(
            self.shared
                .network
                .lock()
                .set_status(&node_id, NodeStatus::Active)?,
        );
        self.shared.events.publish_all(events);

        info!("Node {} ({}) joined", name, node_id);
        Ok(node_id)
    }

    /// Remove a node and every link it had. Unknown ids are ignored.
    pub fn leave(&self, node_id: &str) {
        self.scheduler.cancel(node_id);
        let departure = self.shared.network.lock().remove_node(node_id);
        if let Some(departure) = departure {
            self.shared.events.publish_all(departure.events);
        }
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Link two nodes over `link`. Returns the existing link if already connected.
    pub async fn connect(&self, from: &str, to: &str, link: LinkType) -> MeshResult<Connection> {
        connect_nodes(&self.shared, from, to, link)
            .await
            .map(|(conn, _)| conn)
    }

    /// Remove the link between two nodes. Always succeeds.
    pub fn disconnect(&self, from: &str, to: &str) {
        let events = self.shared.network.lock().disconnect(from, to);
        self.shared.events.publish_all(events);
    }

    /// The local node's links
    pub fn get_connections(&self) -> MeshResult<Vec<Connection>> {
        let network = self.shared.network.lock();
        let local = network.require_local()?;
        Ok(network.registry().require(&local)?.connections.clone())
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Send from the local node
    pub async fn send(
        &self,
        destination: &str,
        message_type: MessageType,
        priority: Priority,
        content: impl Into<Payload>,
        max_hops: u32,
        encrypted: bool,
    ) -> MeshResult<SendReceipt> {
        let source = self.shared.network.lock().require_local()?;
        self.send_from(&source, destination, message_type, priority, content, max_hops, encrypted)
            .await
    }

    /// Send on behalf of any registered node
    #[allow(clippy::too_many_arguments)]
    pub async fn send_from(
        &self,
        source: &str,
        destination: &str,
        message_type: MessageType,
        priority: Priority,
        content: impl Into<Payload>,
        max_hops: u32,
        encrypted: bool,
    ) -> MeshResult<SendReceipt> {
        let _dispatch = self.shared.dispatch.lock().await;

        let msg = self.shared.network.lock().originate(
            source,
            destination,
            message_type,
            priority,
            content.into(),
            max_hops,
            encrypted,
            current_timestamp(),
        )?;
        let message_id = msg.id.clone();
        debug!("Dispatching {} {} -> {}", message_type, source, destination);

        let outcome = delivery::dispatch(&self.shared, msg).await?;
        Ok(SendReceipt { message_id, outcome })
    }

    /// Flood an Emergency message from the local node
    pub async fn send_emergency_broadcast(
        &self,
        content: impl Into<Payload>,
        priority: Priority,
    ) -> MeshResult<SendReceipt> {
        let max_hops = self.shared.config.default_max_hops;
        self.send(
            BROADCAST_DESTINATION,
            MessageType::Emergency,
            priority,
            content,
            max_hops,
            self.shared.config.enable_encryption,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&self, callback: F, kinds: Option<Vec<EventKind>>) -> SubscriptionId
    where
        F: Fn(&MeshEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.shared.events.subscribe(callback, kinds)
    }

    pub fn subscribe_channel(
        &self,
        kinds: Option<Vec<EventKind>>,
    ) -> (SubscriptionId, mpsc::Receiver<MeshEvent>) {
        self.shared.events.subscribe_channel(kinds)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    // ------------------------------------------------------------------
    // Periodic work, callable on demand
    // ------------------------------------------------------------------

    /// Scan from the local node
    pub async fn perform_discovery(&self) -> MeshResult<DiscoveryResult> {
        let local = self.shared.network.lock().require_local()?;
        discovery_pass(&self.shared, &local).await
    }

    pub async fn discover_from(&self, node_id: &str) -> MeshResult<DiscoveryResult> {
        discovery_pass(&self.shared, node_id).await
    }

    /// Beat once for `node_id`; returns how many neighbors heard it
    pub async fn heartbeat(&self, node_id: &str) -> MeshResult<usize> {
        heartbeat::beat(&self.shared, node_id).await
    }

    pub async fn drain_store_and_forward(&self) -> DrainReport {
        let _dispatch = self.shared.dispatch.lock().await;
        delivery::drain(&self.shared).await
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub fn get_network_statistics(&self) -> NetworkStatistics {
        NetworkStatistics::compute(&self.shared.network.lock())
    }

    pub fn get_network_topology(&self) -> NetworkTopology {
        self.shared.network.lock().topology()
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.shared.network.lock().router().message(id).cloned()
    }

    pub fn delivery_state(&self, id: &str) -> Option<DeliveryState> {
        self.shared.network.lock().router().state(id)
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.shared.network.lock().registry().get(id).cloned()
    }

    pub fn local_node_id(&self) -> Option<NodeId> {
        self.shared.network.lock().local_node_id().cloned()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.network.lock().queue().total_count()
    }

    /// Snapshot of the store-and-forward queue
    pub fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.shared.network.lock().queue().iter().cloned().collect()
    }

    pub fn is_scheduled(&self, node_id: &str) -> bool {
        self.scheduler.is_scheduled(node_id)
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduler.scheduled_count()
    }

    /// Stop every background task. Nodes and messages stay queryable.
    pub fn shutdown(&self) {
        self.scheduler.cancel_all();
        *self.state.lock() = ServiceState::Stopped;
        info!("Mesh service stopped");
    }
}

/// Validate, open over the transport, then commit. The bool reports
/// whether a new link was created.
pub(crate) async fn connect_nodes(
    shared: &Shared,
    from: &str,
    to: &str,
    link: LinkType,
) -> MeshResult<(Connection, bool)> {
    let plan = {
        let mut network = shared.network.lock();
        let plan = connection::plan_connection(&network.registry, from, to, link);
        if plan.is_err() {
            connection::record_attempt(&mut network.registry, from, false);
        }
        plan?
    };
    if let ConnectPlan::Existing(existing) = plan {
        return Ok((existing, false));
    }

    let timeout = shared.config.transmit_timeout();
    let opened = match tokio::time::timeout(timeout, shared.transport.connect(from, to, link)).await {
        Ok(result) => result.map_err(MeshError::from),
        Err(_) => Err(MeshError::ConnectionFailed(format!(
            "{} -> {} timed out after {:?}",
            from, to, timeout
        ))),
    };

    let committed = {
        let mut network = shared.network.lock();
        let committed = opened.and_then(|metrics| {
            network.commit_connection(from, to, link, metrics, current_timestamp())
        });
        connection::record_attempt(&mut network.registry, from, committed.is_ok());
        committed
    };

    let (conn, events) = committed?;
    let created = !events.is_empty();
    shared.events.publish_all(events);
    Ok((conn, created))
}

/// Re-measure every link `scanner` holds; links that stop answering are dropped
async fn check_links(shared: &Shared, scanner: &str) -> MeshResult<()> {
    let peers: Vec<NodeId> = {
        let network = shared.network.lock();
        let node = network.registry.require(scanner)?;
        node.connections.iter().map(|c| c.peer_id.clone()).collect()
    };

    let timeout = shared.config.transmit_timeout();
    for peer in peers {
        let measured = match tokio::time::timeout(timeout, shared.transport.probe(scanner, &peer)).await {
            Ok(result) => result.map_err(MeshError::from),
            Err(_) => Err(MeshError::ConnectionFailed(format!(
                "{} -> {} timed out after {:?}",
                scanner, peer, timeout
            ))),
        };

        let events = {
            let mut network = shared.network.lock();
            match measured {
                Ok(metrics) => {
                    network.refresh_link(scanner, &peer, metrics, current_timestamp());
                    Vec::new()
                }
                Err(e) => {
                    warn!("Dropping link {} -> {}: {}", scanner, peer, e);
                    network.disconnect(scanner, &peer)
                }
            }
        };
        shared.events.publish_all(events);
    }
    Ok(())
}

/// One discovery scan from `scanner`, followed by a store-and-forward pass
pub(crate) async fn discovery_pass(shared: &Shared, scanner: &str) -> MeshResult<DiscoveryResult> {
    let started = tokio::time::Instant::now();
    check_links(shared, scanner).await?;

    let plan = {
        let mut network = shared.network.lock();
        let plan = scan_candidates(&network.registry, scanner)?;
        network.registry.touch(scanner, current_timestamp());
        plan
    };

    let mut new_connections = Vec::new();
    for candidate in plan.candidates {
        let has_capacity = shared
            .network
            .lock()
            .registry
            .get(scanner)
            .map_or(false, |n| n.has_capacity());
        if !has_capacity {
            break;
        }

        match connect_nodes(shared, scanner, &candidate.peer_id, candidate.link_type).await {
            Ok((_, true)) => new_connections.push(candidate.peer_id),
            Ok((_, false)) => {}
            Err(e) => debug!("Discovery link {} -> {} failed: {}", scanner, candidate.peer_id, e),
        }
    }

    {
        let _dispatch = shared.dispatch.lock().await;
        delivery::drain(shared).await;
    }

    Ok(DiscoveryResult {
        scanner_id: scanner.to_string(),
        nodes_discovered: plan.in_range,
        new_connections,
        scan_duration: started.elapsed(),
    })
}
