//! Store-and-forward: custody, backoff, expiry and later delivery
//!
//! Run with: cargo test --test integration_store_forward

use meshlink_core::{
    DeliveryOutcome, DeliveryState, EventKind, GeoLocation, LinkType, LoopbackTransport, MeshError,
    MeshEvent, MeshService, MessageType, NetworkConfig, NodeCapabilities, Priority, QueueConfig,
    RetryStrategy,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const STEP_DEG: f64 = 0.0008;

fn at_step(step: usize) -> GeoLocation {
    GeoLocation {
        latitude: step as f64 * STEP_DEG,
        longitude: 0.0,
        accuracy_m: 5.0,
        timestamp: 0,
    }
}

fn fast_retry_config() -> NetworkConfig {
    NetworkConfig {
        queue: QueueConfig {
            base_delay_ms: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_backoff_grows_until_dropped() {
    let service = MeshService::manual(fast_retry_config(), Arc::new(LoopbackTransport::new())).unwrap();
    let a = service.join("a", "a", NodeCapabilities::handheld(), at_step(0)).unwrap();
    let b = service.join("b", "b", NodeCapabilities::handheld(), at_step(10)).unwrap();

    let receipt = service
        .send(&b, MessageType::Status, Priority::Medium, "anyone there?", 5, false)
        .await
        .unwrap();
    assert_eq!(receipt.outcome, DeliveryOutcome::Queued);
    assert_eq!(service.delivery_state(&receipt.message_id), Some(DeliveryState::Queued));

    let queued = service.queued_messages();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].custodian_id, a);
    assert_eq!(queued[0].target_id, b);
    assert_eq!(queued[0].attempts, 0);

    let mut delays = Vec::new();
    let mut dropped = 0;
    for _ in 0..500 {
        let report = service.drain_store_and_forward().await;
        dropped += report.dropped;
        if report.rescheduled > 0 {
            let entry = service.queued_messages().remove(0);
            let last = entry.last_attempt.unwrap();
            delays.push(entry.next_attempt - last);
        }
        if service.queued_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert_eq!(delays, vec![2, 4, 8, 16]);
    assert_eq!(dropped, 1);
    assert_eq!(service.queued_count(), 0);
    assert_eq!(service.delivery_state(&receipt.message_id), Some(DeliveryState::Failed));
    assert_eq!(service.get_network_statistics().failed_messages, 1);
}

#[tokio::test]
async fn test_queued_message_delivered_once_bridged() {
    let service = MeshService::manual(NetworkConfig::default(), Arc::new(LoopbackTransport::new())).unwrap();
    let a = service.join("a", "a", NodeCapabilities::handheld(), at_step(0)).unwrap();
    let c = service.join("c", "c", NodeCapabilities::handheld(), at_step(2)).unwrap();

    // Too far apart to link on their own
    let scan = service.discover_from(&a).await.unwrap();
    assert!(scan.nodes_discovered.is_empty());

    let receipt = service
        .send(&c, MessageType::Resource, Priority::High, "medical kit ready", 5, false)
        .await
        .unwrap();
    assert_eq!(receipt.outcome, DeliveryOutcome::Queued);

    let (_, mut rx) = service.subscribe_channel(Some(vec![EventKind::MessageDelivered]));
    let b = service.join("b", "b", NodeCapabilities::handheld(), at_step(1)).unwrap();
    let scan = service.discover_from(&b).await.unwrap();
    assert_eq!(scan.new_connections.len(), 2);

    assert_eq!(service.queued_count(), 0);
    assert_eq!(service.delivery_state(&receipt.message_id), Some(DeliveryState::Delivered));
    match rx.try_recv().unwrap() {
        MeshEvent::MessageDelivered { message_id, destination_id, hops } => {
            assert_eq!(message_id, receipt.message_id);
            assert_eq!(destination_id, c);
            assert_eq!(hops, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_stalled_walk_resumes_from_custodian() {
    let transport = Arc::new(LoopbackTransport::new());
    let service = MeshService::manual(NetworkConfig::default(), transport.clone()).unwrap();
    let a = service.join("a", "a", NodeCapabilities::handheld(), at_step(0)).unwrap();
    let b = service.join("b", "b", NodeCapabilities::handheld(), at_step(1)).unwrap();
    let c = service.join("c", "c", NodeCapabilities::handheld(), at_step(2)).unwrap();
    service.connect(&a, &b, LinkType::Bluetooth).await.unwrap();
    service.connect(&b, &c, LinkType::Bluetooth).await.unwrap();
    transport.sever(&b, &c);

    let receipt = service
        .send(&c, MessageType::Coordination, Priority::High, "hold position", 5, false)
        .await
        .unwrap();
    assert_eq!(receipt.outcome, DeliveryOutcome::Queued);
    let queued = service.queued_messages();
    assert_eq!(queued[0].custodian_id, b);
    assert_eq!(queued[0].message.hop_count(), 1);

    transport.restore(&b, &c);
    let report = service.drain_store_and_forward().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);

    let record = service.message(&receipt.message_id).unwrap();
    let hop_ids: Vec<_> = record.routing.hops.iter().map(|h| h.node_id.clone()).collect();
    assert_eq!(hop_ids, vec![a, b]);
    assert_eq!(service.delivery_state(&receipt.message_id), Some(DeliveryState::Delivered));
}

#[tokio::test]
async fn test_expired_entry_is_dropped() {
    let config = NetworkConfig {
        message_ttl_secs: 0,
        ..Default::default()
    };
    let service = MeshService::manual(config, Arc::new(LoopbackTransport::new())).unwrap();
    service.join("a", "a", NodeCapabilities::handheld(), at_step(0)).unwrap();
    let b = service.join("b", "b", NodeCapabilities::handheld(), at_step(10)).unwrap();

    let receipt = service
        .send(&b, MessageType::Status, Priority::Low, "short lived", 5, false)
        .await
        .unwrap();
    assert_eq!(receipt.outcome, DeliveryOutcome::Queued);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = service.drain_store_and_forward().await;

    assert_eq!(report.dropped, 1);
    assert_eq!(report.attempted, 0);
    assert_eq!(service.queued_count(), 0);
    assert_eq!(service.delivery_state(&receipt.message_id), Some(DeliveryState::Failed));
}

#[tokio::test]
async fn test_departure_releases_custody() {
    let service = MeshService::manual(NetworkConfig::default(), Arc::new(LoopbackTransport::new())).unwrap();
    let a = service.join("a", "a", NodeCapabilities::handheld(), at_step(0)).unwrap();
    let b = service.join("b", "b", NodeCapabilities::handheld(), at_step(10)).unwrap();
    let c = service.join("c", "c", NodeCapabilities::handheld(), at_step(20)).unwrap();

    let to_b = service
        .send(&b, MessageType::Status, Priority::Low, "for b", 5, false)
        .await
        .unwrap();
    let to_c = service
        .send(&c, MessageType::Status, Priority::Low, "for c", 5, false)
        .await
        .unwrap();
    assert_eq!(service.queued_count(), 2);

    // Target leaves
    service.leave(&b);
    assert_eq!(service.queued_count(), 1);
    assert_eq!(service.delivery_state(&to_b.message_id), Some(DeliveryState::Failed));

    // Custodian leaves
    service.leave(&a);
    assert_eq!(service.queued_count(), 0);
    assert_eq!(service.delivery_state(&to_c.message_id), Some(DeliveryState::Failed));
    assert_eq!(service.local_node_id(), None);
}

#[tokio::test]
async fn test_no_custody_without_store_and_forward() {
    let config = NetworkConfig {
        store_and_forward: false,
        ..Default::default()
    };
    let service = MeshService::manual(config, Arc::new(LoopbackTransport::new())).unwrap();
    service.join("a", "a", NodeCapabilities::handheld(), at_step(0)).unwrap();
    let b = service.join("b", "b", NodeCapabilities::handheld(), at_step(10)).unwrap();

    let result = service
        .send(&b, MessageType::Status, Priority::Low, "lost", 5, false)
        .await;
    assert!(result.is_err());
    assert_eq!(service.queued_count(), 0);
    assert_eq!(service.get_network_statistics().failed_messages, 1);
}

#[test]
fn test_cap_that_would_flatten_backoff_is_rejected() {
    let config = NetworkConfig {
        queue: QueueConfig {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let result = MeshService::manual(config, Arc::new(LoopbackTransport::new()));
    assert!(matches!(result, Err(MeshError::Config(_))));
}

proptest! {
    #[test]
    fn prop_backoff_is_monotonic_and_capped(
        base_ms in 1u64..5_000,
        cap_factor in 1u64..10_000,
        attempts in 0u32..64,
    ) {
        let strategy = RetryStrategy {
            max_attempts: 5,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(base_ms * cap_factor),
        };

        let now = strategy.calculate_delay(attempts);
        let next = strategy.calculate_delay(attempts + 1);
        prop_assert!(next >= now);
        prop_assert!(now <= strategy.max_delay);
        prop_assert!(now >= strategy.base_delay);
    }

    #[test]
    fn prop_valid_config_backoff_strictly_grows(
        base_delay_ms in 1u64..5_000,
        max_attempts in 1u32..12,
        slack in 0u64..100_000,
    ) {
        let queue = QueueConfig {
            max_attempts,
            base_delay_ms,
            max_delay_ms: (base_delay_ms << (max_attempts - 1)) + slack,
            ..Default::default()
        };
        let config = NetworkConfig { queue, ..Default::default() };
        prop_assert!(config.validate().is_ok());

        // Delays actually used are for attempts 1..max_attempts
        let strategy = RetryStrategy::from(&config.queue);
        for attempts in 1..max_attempts.saturating_sub(1) {
            prop_assert!(strategy.calculate_delay(attempts + 1) > strategy.calculate_delay(attempts));
        }
    }
}
