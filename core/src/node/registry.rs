//! Node Registry — every known node, in join order
//!
//! Lookups are by id; iteration follows registration order so scans and
//! route rebuilds are deterministic.

use super::types::{Node, NodeId, NodeStatus};
use crate::{MeshError, MeshResult};
use std::collections::HashMap;
use tracing::debug;

/// A status transition produced by the liveness sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub node_id: NodeId,
    pub from: NodeStatus,
    pub to: NodeStatus,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeId, Node>,
    order: Vec<NodeId>,
    max_nodes: usize,
}

impl NodeRegistry {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            max_nodes,
        }
    }

    /// Add a node; fails once `max_nodes` is reached
    pub fn register(&mut self, node: Node) -> MeshResult<NodeId> {
        if self.nodes.len() >= self.max_nodes && !self.nodes.contains_key(&node.id) {
            return Err(MeshError::NetworkFull(self.max_nodes));
        }

        let id = node.id.clone();
        if self.nodes.insert(id.clone(), node).is_none() {
            self.order.push(id.clone());
        }
        Ok(id)
    }

    pub fn remove(&mut self, node_id: &str) -> Option<Node> {
        let node = self.nodes.remove(node_id)?;
        self.order.retain(|id| id != node_id);
        Some(node)
    }

    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn get_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(node_id)
    }

    /// Lookup that fails with `NodeNotFound`
    pub fn require(&self, node_id: &str) -> MeshResult<&Node> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| MeshError::NodeNotFound(node_id.to_string()))
    }

    pub fn require_mut(&mut self, node_id: &str) -> MeshResult<&mut Node> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| MeshError::NodeNotFound(node_id.to_string()))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.order
    }

    pub fn active_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .count()
    }

    /// Set a node's status. Returns the previous status when it changed.
    pub fn set_status(&mut self, node_id: &str, status: NodeStatus) -> MeshResult<Option<NodeStatus>> {
        let node = self.require_mut(node_id)?;
        if node.status == status {
            return Ok(None);
        }
        let previous = node.status;
        node.status = status;
        debug!("Node {} {} -> {}", node_id, previous, status);
        Ok(Some(previous))
    }

    /// Record a sign of life
    pub fn touch(&mut self, node_id: &str, now: u64) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.last_seen = node.last_seen.max(now);
        }
    }

    /// Demote silent nodes: Active → Inactive → Unreachable, Disconnected → Unreachable
    pub fn sweep_liveness(
        &mut self,
        now: u64,
        inactive_after_ms: u64,
        unreachable_after_ms: u64,
    ) -> Vec<StatusChange> {
        let mut changes = Vec::new();

        for id in &self.order {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            let silent_for = now.saturating_sub(node.last_seen);
            let next = match node.status {
                NodeStatus::Active | NodeStatus::Inactive | NodeStatus::Disconnected
                    if silent_for > unreachable_after_ms =>
                {
                    Some(NodeStatus::Unreachable)
                }
                NodeStatus::Active if silent_for > inactive_after_ms => Some(NodeStatus::Inactive),
                _ => None,
            };

            if let Some(to) = next {
                changes.push(StatusChange {
                    node_id: id.clone(),
                    from: node.status,
                    to,
                });
                node.status = to;
            }
        }

        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{GeoLocation, NodeCapabilities};

    fn make_node(name: &str, now: u64) -> Node {
        Node::new(
            format!("dev-{}", name),
            name.to_string(),
            NodeCapabilities::handheld(),
            GeoLocation::new(0.0, 0.0),
            now,
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = NodeRegistry::new(10);
        let id = registry.register(make_node("a", 0)).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().name, "a");
        assert!(matches!(
            registry.require("missing"),
            Err(MeshError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_capacity_limit() {
        let mut registry = NodeRegistry::new(2);
        registry.register(make_node("a", 0)).unwrap();
        registry.register(make_node("b", 0)).unwrap();

        let result = registry.register(make_node("c", 0));
        assert_eq!(result, Err(MeshError::NetworkFull(2)));
    }

    #[test]
    fn test_iteration_follows_join_order() {
        let mut registry = NodeRegistry::new(10);
        let a = registry.register(make_node("a", 0)).unwrap();
        let b = registry.register(make_node("b", 0)).unwrap();
        let c = registry.register(make_node("c", 0)).unwrap();

        registry.remove(&b);
        let names: Vec<_> = registry.iter().map(|n| n.id.clone()).collect();
        assert_eq!(names, vec![a, c]);
    }

    #[test]
    fn test_set_status_reports_change() {
        let mut registry = NodeRegistry::new(10);
        let id = registry.register(make_node("a", 0)).unwrap();

        assert_eq!(
            registry.set_status(&id, NodeStatus::Active).unwrap(),
            Some(NodeStatus::Connecting)
        );
        assert_eq!(registry.set_status(&id, NodeStatus::Active).unwrap(), None);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_liveness_sweep() {
        let mut registry = NodeRegistry::new(10);
        let quiet = registry.register(make_node("quiet", 0)).unwrap();
        let chatty = registry.register(make_node("chatty", 0)).unwrap();
        registry.set_status(&quiet, NodeStatus::Active).unwrap();
        registry.set_status(&chatty, NodeStatus::Active).unwrap();

        registry.touch(&chatty, 3_500);
        let changes = registry.sweep_liveness(4_000, 3_000, 6_000);
        assert_eq!(
            changes,
            vec![StatusChange {
                node_id: quiet.clone(),
                from: NodeStatus::Active,
                to: NodeStatus::Inactive,
            }]
        );

        registry.touch(&chatty, 6_500);
        let changes = registry.sweep_liveness(7_000, 3_000, 6_000);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, NodeStatus::Unreachable);
        assert_eq!(registry.get(&chatty).unwrap().status, NodeStatus::Active);
    }

    #[test]
    fn test_disconnected_node_goes_unreachable_when_silent() {
        let mut registry = NodeRegistry::new(10);
        let lone = registry.register(make_node("lone", 0)).unwrap();
        registry.set_status(&lone, NodeStatus::Disconnected).unwrap();

        assert!(registry.sweep_liveness(4_000, 3_000, 6_000).is_empty());
        let changes = registry.sweep_liveness(7_000, 3_000, 6_000);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].from, NodeStatus::Disconnected);
        assert_eq!(changes[0].to, NodeStatus::Unreachable);
    }
}
