//! Routing — shortest-hop table plus per-message forwarding decisions
//!
//! - `table`: BFS paths between every pair of nodes, rebuilt on topology change
//! - `router`: message records, seen caches, flood and unicast hop planning

pub mod router;
pub mod table;

pub use router::{DeliveryState, FloodStep, HopBlocked, MessageRouter, Reception, Transmission};
pub use table::RoutingTable;
