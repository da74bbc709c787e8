//! Transport abstraction layer
//!
//! Defines the link types a node can speak and the `Transport` trait the
//! mesh core drives. Real radio drivers implement the trait; tests use
//! `LoopbackTransport` or a mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Physical / radio medium used between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkType {
    /// Bluetooth Low Energy
    Bluetooth,
    /// WiFi Direct (peer-to-peer)
    WifiDirect,
    /// WiFi Aware (Neighbor Awareness Networking)
    WifiAware,
    /// Low-power wide-area radio
    LoRa,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::Bluetooth => write!(f, "bluetooth"),
            LinkType::WifiDirect => write!(f, "wifi-direct"),
            LinkType::WifiAware => write!(f, "wifi-aware"),
            LinkType::LoRa => write!(f, "lora"),
        }
    }
}

/// Nominal characteristics of a link type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkProfile {
    /// Estimated one-way latency in milliseconds
    pub estimated_latency_ms: u32,
    /// Typical received signal strength in dBm
    pub typical_signal_dbm: i32,
    /// Estimated bandwidth in kilobits per second
    pub estimated_bandwidth_kbps: u32,
}

impl LinkProfile {
    /// Get default profile for a link type
    pub fn for_link(link: LinkType) -> Self {
        match link {
            LinkType::Bluetooth => Self {
                estimated_latency_ms: 50,
                typical_signal_dbm: -65,
                estimated_bandwidth_kbps: 2_000,
            },
            LinkType::WifiDirect => Self {
                estimated_latency_ms: 5,
                typical_signal_dbm: -55,
                estimated_bandwidth_kbps: 250_000,
            },
            LinkType::WifiAware => Self {
                estimated_latency_ms: 10,
                typical_signal_dbm: -60,
                estimated_bandwidth_kbps: 80_000,
            },
            LinkType::LoRa => Self {
                estimated_latency_ms: 400,
                typical_signal_dbm: -110,
                estimated_bandwidth_kbps: 50,
            },
        }
    }
}

/// Measured link quality returned by `connect` and `probe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMetrics {
    pub latency_ms: u32,
    pub signal_strength_dbm: i32,
}

/// Link driver beneath the mesh core.
///
/// Calls may complete asynchronously; the core bounds each one with the
/// configured transmit timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link of the given type from `from` to `to`
    async fn connect(&self, from: &str, to: &str, link: LinkType) -> Result<LinkMetrics, TransportError>;

    /// Push one encoded frame over an established link
    async fn send(&self, from: &str, to: &str, link: LinkType, frame: &[u8]) -> Result<(), TransportError>;

    /// Measure whether `to` still answers `from`. Discovery drops links that fail it.
    async fn probe(&self, from: &str, to: &str) -> Result<LinkMetrics, TransportError>;
}

/// Errors that can occur in the transport layer
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
