// Node module — participants and their registry

pub mod registry;
pub mod types;

pub use registry::{NodeRegistry, StatusChange};
pub use types::{GeoLocation, Node, NodeCapabilities, NodeId, NodeMetrics, NodeStatus};
