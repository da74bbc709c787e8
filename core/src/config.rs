// Network configuration
//
// Immutable for the lifetime of a `Network`. Loaded from JSON (all fields
// optional, missing ones take defaults) or built in code.

use crate::events::DEFAULT_CHANNEL_CAPACITY;
use crate::message::{RoutingAlgorithm, MAX_PAYLOAD_SIZE};
use crate::MeshError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Maximum registered nodes
    pub max_nodes: usize,

    /// Maximum payload size in bytes (content + attachments)
    pub max_message_size: usize,

    /// Message time-to-live in seconds
    pub message_ttl_secs: u64,

    /// Heartbeat period in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Discovery scan period in milliseconds
    pub discovery_interval_ms: u64,

    /// Routing algorithm tag stamped on unicast messages
    pub routing_algorithm: RoutingAlgorithm,

    /// Hop limit for emergency broadcasts and default sends
    pub default_max_hops: u32,

    /// Upper bound on a single transport call
    pub transmit_timeout_ms: u64,

    /// Seen-message ids remembered per node
    pub max_seen_ids: usize,

    /// Heartbeats missed before a node is marked inactive
    pub inactive_after_heartbeats: u32,

    /// Heartbeats missed before a node is marked unreachable
    pub unreachable_after_heartbeats: u32,

    pub enable_encryption: bool,
    pub enable_compression: bool,
    pub reliable_delivery: bool,
    pub store_and_forward: bool,

    /// Events buffered per channel subscriber before new ones are dropped
    pub event_channel_capacity: usize,

    /// Store-and-forward queue settings
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failed attempts before a queued message is dropped
    pub max_attempts: u32,

    /// Backoff unit: delay after attempt n is 2^n * base
    pub base_delay_ms: u64,

    /// Ceiling for a single backoff delay
    pub max_delay_ms: u64,

    /// Maximum queued messages per unreached target
    pub max_per_target: usize,

    /// Maximum queued messages overall
    pub max_total: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_nodes: 256,
            max_message_size: 64 * 1024,
            message_ttl_secs: 3600,
            heartbeat_interval_ms: 30_000,
            discovery_interval_ms: 10_000,
            routing_algorithm: RoutingAlgorithm::ShortestPath,
            default_max_hops: 10,
            transmit_timeout_ms: 5_000,
            max_seen_ids: 50_000,
            inactive_after_heartbeats: 3,
            unreachable_after_heartbeats: 6,
            enable_encryption: true,
            enable_compression: false,
            reliable_delivery: true,
            store_and_forward: true,
            event_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            queue: QueueConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 3_600_000,
            max_per_target: 1_000,
            max_total: 10_000,
        }
    }
}

impl NetworkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn transmit_timeout(&self) -> Duration {
        Duration::from_millis(self.transmit_timeout_ms)
    }

    /// Silence after which a node is considered inactive (ms)
    pub fn inactive_after_ms(&self) -> u64 {
        self.heartbeat_interval_ms * self.inactive_after_heartbeats as u64
    }

    /// Silence after which a node is considered unreachable (ms)
    pub fn unreachable_after_ms(&self) -> u64 {
        self.heartbeat_interval_ms * self.unreachable_after_heartbeats as u64
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.max_nodes == 0 {
            return Err(MeshError::Config("max_nodes must be positive".to_string()));
        }
        if self.max_message_size == 0 || self.max_message_size > MAX_PAYLOAD_SIZE {
            return Err(MeshError::Config(format!(
                "max_message_size must be in 1..={}",
                MAX_PAYLOAD_SIZE
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.discovery_interval_ms == 0 {
            return Err(MeshError::Config(
                "heartbeat and discovery intervals must be positive".to_string(),
            ));
        }
        if self.default_max_hops == 0 {
            return Err(MeshError::Config("default_max_hops must be positive".to_string()));
        }
        if self.inactive_after_heartbeats == 0
            || self.unreachable_after_heartbeats <= self.inactive_after_heartbeats
        {
            return Err(MeshError::Config(
                "unreachable threshold must exceed inactive threshold".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 || self.queue.base_delay_ms == 0 {
            return Err(MeshError::Config(
                "queue max_attempts and base_delay_ms must be positive".to_string(),
            ));
        }
        // Every delay up to the last retry must grow, so the cap may not bite early
        let last_delay = 1u64
            .checked_shl(self.queue.max_attempts - 1)
            .filter(|_| self.queue.max_attempts <= 32)
            .and_then(|factor| self.queue.base_delay_ms.checked_mul(factor));
        match last_delay {
            Some(last) if last <= self.queue.max_delay_ms => {}
            Some(last) => {
                return Err(MeshError::Config(format!(
                    "queue max_delay_ms must be at least {} for {} attempts",
                    last, self.queue.max_attempts
                )));
            }
            None => {
                return Err(MeshError::Config(
                    "queue backoff overflows; lower max_attempts or base_delay_ms".to_string(),
                ));
            }
        }
        if self.event_channel_capacity == 0 {
            return Err(MeshError::Config(
                "event_channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse a JSON document; absent fields take defaults
    pub fn from_json(contents: &str) -> Result<Self> {
        let config: NetworkConfig =
            serde_json::from_str(contents).context("Failed to parse network config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&contents)
    }

    /// Save config as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize network config")?;
        std::fs::write(path.as_ref(), contents).context("Failed to write config file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NetworkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_attempts, 5);
        assert!(config.store_and_forward);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = NetworkConfig::from_json(
            r#"{"max_nodes": 12, "store_and_forward": false, "queue": {"base_delay_ms": 250}}"#,
        )
        .unwrap();

        assert_eq!(config.max_nodes, 12);
        assert!(!config.store_and_forward);
        assert_eq!(config.queue.base_delay_ms, 250);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn test_reject_invalid_thresholds() {
        let config = NetworkConfig {
            inactive_after_heartbeats: 4,
            unreachable_after_heartbeats: 4,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MeshError::Config(_))));
    }

    #[test]
    fn test_reject_oversized_message_limit() {
        let config = NetworkConfig {
            max_message_size: 1024 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = NetworkConfig {
            max_message_size: MAX_PAYLOAD_SIZE,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reject_cap_below_last_backoff() {
        // 5 attempts from 1 ms: the last retry waits 16 ms
        let capped = |max_delay_ms| NetworkConfig {
            queue: QueueConfig {
                base_delay_ms: 1,
                max_delay_ms,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(capped(2).validate(), Err(MeshError::Config(_))));
        assert!(capped(15).validate().is_err());
        assert!(capped(16).validate().is_ok());

        let runaway = NetworkConfig {
            queue: QueueConfig {
                max_attempts: 80,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(runaway.validate().is_err());
    }

    #[test]
    fn test_reject_zero_channel_capacity() {
        let config = NetworkConfig {
            event_channel_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");

        let config = NetworkConfig {
            discovery_interval_ms: 2_500,
            enable_compression: true,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = NetworkConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_liveness_thresholds() {
        let config = NetworkConfig {
            heartbeat_interval_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(config.inactive_after_ms(), 3_000);
        assert_eq!(config.unreachable_after_ms(), 6_000);
    }
}
