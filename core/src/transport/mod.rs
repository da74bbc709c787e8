// Transport module — links, discovery and the driver seam beneath them

pub mod abstraction;
pub mod connection;
pub mod discovery;
pub mod loopback;

pub use abstraction::{LinkMetrics, LinkProfile, LinkType, Transport, TransportError};
pub use connection::{ConnectPlan, Connection};
pub use discovery::{haversine_distance_m, DiscoveryCandidate, DiscoveryResult, ScanPlan};
pub use loopback::{FrameRecord, LoopbackTransport};
