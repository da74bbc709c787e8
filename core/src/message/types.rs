// Message types — what travels across the mesh

use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique message identifier (UUID v4)
pub type MessageId = String;

/// Destination sentinel for flooded messages
pub const BROADCAST_DESTINATION: &str = "broadcast";

/// What kind of message this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Emergency,
    Status,
    Resource,
    Coordination,
    Heartbeat,
    Discovery,
    Relay,
    Ack,
}

impl MessageType {
    /// Control traffic is exempt from message records, acknowledgments and app events
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            MessageType::Heartbeat | MessageType::Discovery | MessageType::Ack
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Emergency => "emergency",
            MessageType::Status => "status",
            MessageType::Resource => "resource",
            MessageType::Coordination => "coordination",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Discovery => "discovery",
            MessageType::Relay => "relay",
            MessageType::Ack => "ack",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Routing strategy tag carried in message metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingAlgorithm {
    /// Hop-bounded flooding with seen-id dedupe
    Flooding,
    /// Unweighted shortest-hop path from the routing table
    ShortestPath,
}

/// Attachment metadata (bodies travel out of band)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub content_type: String,
    pub content: String,
    pub attachments: Option<Vec<Attachment>>,
    pub compressed: bool,
    /// Content bytes plus attachment sizes
    pub size: usize,
}

impl Payload {
    pub fn text(content: &str) -> Self {
        Self {
            content_type: "text/plain".to_string(),
            content: content.to_string(),
            attachments: None,
            compressed: false,
            size: content.len(),
        }
    }

    /// JSON document payload
    pub fn json(content: String) -> Self {
        Self {
            content_type: "application/json".to_string(),
            size: content.len(),
            content,
            attachments: None,
            compressed: false,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.size = self.content.len() + attachments.iter().map(|a| a.size).sum::<usize>();
        self.attachments = Some(attachments);
        self
    }
}

impl From<&str> for Payload {
    fn from(content: &str) -> Self {
        Payload::text(content)
    }
}

impl From<String> for Payload {
    fn from(content: String) -> Self {
        Payload::text(&content)
    }
}

/// One forwarding step: the node that transmitted and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hop {
    pub node_id: NodeId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingInfo {
    /// Transmitting nodes in order
    pub hops: Vec<Hop>,
    pub max_hops: u32,
    /// Time-to-live in seconds
    pub ttl: u64,
    pub algorithm: RoutingAlgorithm,
    /// Precomputed path (next hops through the destination)
    pub path: Option<Vec<NodeId>>,
}

/// Encryption is modeled as a tag only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionInfo {
    pub algorithm: String,
    pub key_id: Option<String>,
    pub signature: Option<String>,
}

impl EncryptionInfo {
    pub fn none() -> Self {
        Self {
            algorithm: "none".to_string(),
            key_id: None,
            signature: None,
        }
    }

    pub fn aes_gcm(key_id: String) -> Self {
        Self {
            algorithm: "AES-256-GCM".to_string(),
            key_id: Some(key_id),
            signature: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.algorithm != "none"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment {
    pub node_id: NodeId,
    pub timestamp: u64,
    pub received: bool,
    pub relayed: bool,
}

/// A mesh message. Only `routing.hops` and `acknowledgments` change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    pub source_id: NodeId,
    pub destination_id: NodeId,
    pub payload: Payload,
    pub routing: RoutingInfo,
    pub encryption: EncryptionInfo,
    /// Creation time (Unix ms)
    pub timestamp: u64,
    /// Expiry (Unix ms)
    pub expires_at: u64,
    pub acknowledgments: Vec<Acknowledgment>,
}

impl Message {
    /// Create a new message. `ttl_secs` sets `expires_at`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: NodeId,
        destination_id: NodeId,
        message_type: MessageType,
        priority: Priority,
        payload: Payload,
        max_hops: u32,
        ttl_secs: u64,
        now: u64,
    ) -> Self {
        let algorithm = if destination_id == BROADCAST_DESTINATION {
            RoutingAlgorithm::Flooding
        } else {
            RoutingAlgorithm::ShortestPath
        };

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type,
            priority,
            source_id,
            destination_id,
            payload,
            routing: RoutingInfo {
                hops: Vec::new(),
                max_hops,
                ttl: ttl_secs,
                algorithm,
                path: None,
            },
            encryption: EncryptionInfo::none(),
            timestamp: now,
            expires_at: now.saturating_add(ttl_secs.saturating_mul(1000)),
            acknowledgments: Vec::new(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination_id == BROADCAST_DESTINATION
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    pub fn hop_count(&self) -> usize {
        self.routing.hops.len()
    }

    /// Whether one more hop record still fits under `max_hops`
    pub fn has_hop_budget(&self) -> bool {
        self.routing.hops.len() < self.routing.max_hops as usize
    }

    /// Append a hop record for the transmitting node
    pub fn push_hop(&mut self, node_id: &str, now: u64) {
        self.routing.hops.push(Hop {
            node_id: node_id.to_string(),
            timestamp: now,
        });
    }

    pub fn visited(&self, node_id: &str) -> bool {
        self.source_id == node_id || self.routing.hops.iter().any(|h| h.node_id == node_id)
    }

    pub fn acknowledgment_from(&self, node_id: &str) -> Option<&Acknowledgment> {
        self.acknowledgments.iter().find(|a| a.node_id == node_id)
    }
}
