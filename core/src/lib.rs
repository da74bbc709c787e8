// Meshlink Core — infrastructure-free mesh networking
//
// Nodes discover each other over short-range links, form a topology,
// and move messages hop by hop: flooded broadcasts, routed unicasts,
// and store-and-forward custody when no route exists yet.

pub mod config;
pub mod events;
pub mod message;
pub mod network;
pub mod node;
pub mod routing;
pub mod service;
pub mod stats;
pub mod store;
pub mod transport;

use thiserror::Error;

pub use config::{NetworkConfig, QueueConfig};
pub use events::{EventBus, EventKind, MeshEvent, SubscriptionId};
pub use message::{Message, MessageId, MessageType, Payload, Priority, BROADCAST_DESTINATION};
pub use network::{Network, NetworkTopology, TopologyEdge, TopologyNode};
pub use node::{GeoLocation, Node, NodeCapabilities, NodeId, NodeMetrics, NodeStatus};
pub use routing::{DeliveryState, MessageRouter, RoutingTable};
pub use service::{DeliveryOutcome, DrainReport, HeartbeatStatus, MeshService, SendReceipt, ServiceState};
pub use stats::NetworkStatistics;
pub use store::{QueuedMessage, RetryStrategy, SeenCache, StoreAndForwardQueue};
pub use transport::{
    Connection, DiscoveryResult, LinkMetrics, LinkType, LoopbackTransport, Transport,
    TransportError,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeshError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("Incompatible link type {link} between {from} and {to}")]
    IncompatibleLinkType {
        from: NodeId,
        to: NodeId,
        link: LinkType,
    },
    #[error("Connection limit reached on node {0}")]
    ConnectionLimitReached(NodeId),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("No route found to {0}")]
    NoRouteFound(NodeId),
    #[error("Local node not initialized")]
    LocalNodeNotInitialized,
    #[error("Network full ({0} nodes)")]
    NetworkFull(usize),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<TransportError> for MeshError {
    fn from(err: TransportError) -> Self {
        MeshError::ConnectionFailed(err.to_string())
    }
}

impl From<message::CodecError> for MeshError {
    fn from(err: message::CodecError) -> Self {
        MeshError::Codec(err.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;

// ============================================================================
// LOGGING
// ============================================================================

/// Install the default `tracing` subscriber (idempotent).
///
/// Honors `RUST_LOG`; falls back to `info`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Current wall-clock time as Unix milliseconds.
pub(crate) fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
