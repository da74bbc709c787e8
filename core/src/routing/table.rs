//! Routing table — shortest-hop paths between every pair of nodes
//!
//! Rebuilt from scratch whenever a link appears or disappears. Each entry
//! maps `(source, destination)` to the hops after the source, ending with
//! the destination. Paths are unweighted: fewest hops wins, ties go to the
//! neighbor that was linked first.

use crate::node::{NodeId, NodeRegistry};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct RoutingTable {
    routes: HashMap<(NodeId, NodeId), Vec<NodeId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute all paths with one BFS per node.
    ///
    /// Nodes that cannot relay are reachable as destinations but never
    /// expanded as intermediates.
    pub fn rebuild(&mut self, registry: &NodeRegistry) {
        self.routes.clear();

        for source in registry.iter() {
            let mut parent: HashMap<&str, &str> = HashMap::new();
            let mut queue: VecDeque<&str> = VecDeque::new();
            parent.insert(source.id.as_str(), source.id.as_str());
            queue.push_back(source.id.as_str());

            while let Some(current) = queue.pop_front() {
                let Some(node) = registry.get(current) else {
                    continue;
                };
                if current != source.id && !node.capabilities.relay_capable {
                    continue;
                }

                for peer in node.peer_ids() {
                    if parent.contains_key(peer.as_str()) || !registry.contains(peer) {
                        continue;
                    }
                    parent.insert(peer.as_str(), current);
                    queue.push_back(peer.as_str());

                    let mut path = vec![peer.clone()];
                    let mut step = current;
                    while step != source.id {
                        path.push(step.to_string());
                        step = parent[step];
                    }
                    path.reverse();
                    self.routes.insert((source.id.clone(), peer.clone()), path);
                }
            }
        }

        debug!("Routing table rebuilt: {} routes", self.routes.len());
    }

    /// Hops from `from` to `to`, ending with `to`
    pub fn path(&self, from: &str, to: &str) -> Option<&[NodeId]> {
        self.routes
            .get(&(from.to_string(), to.to_string()))
            .map(|p| p.as_slice())
    }

    pub fn next_hop(&self, from: &str, to: &str) -> Option<&NodeId> {
        self.path(from, to).and_then(|p| p.first())
    }

    /// Longest shortest path, in hops
    pub fn diameter(&self) -> usize {
        self.routes.values().map(|p| p.len()).max().unwrap_or(0)
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// All destinations reachable from `from`
    pub fn destinations(&self, from: &str) -> Vec<&NodeId> {
        self.routes
            .keys()
            .filter(|(src, _)| src == from)
            .map(|(_, dst)| dst)
            .collect()
    }
}
