// Event bus — topology and message lifecycle notifications
//
// Events are collected while the network lock is held and published after
// it is released. Fan-out is synchronous; a failing or panicking
// subscriber is logged and skipped, the rest still receive the event.

use crate::message::{Message, MessageId};
use crate::node::{NodeId, NodeStatus};
use crate::transport::LinkType;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Buffered events per channel subscriber
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    NodeJoined {
        node_id: NodeId,
        name: String,
    },
    NodeLeft {
        node_id: NodeId,
    },
    ConnectionEstablished {
        from: NodeId,
        to: NodeId,
        link_type: LinkType,
    },
    ConnectionLost {
        from: NodeId,
        to: NodeId,
    },
    /// A node accepted a message; `from` is the node that transmitted it
    MessageReceived {
        node_id: NodeId,
        from: NodeId,
        message: Message,
    },
    /// A unicast reached its destination
    MessageDelivered {
        message_id: MessageId,
        destination_id: NodeId,
        hops: usize,
    },
    NetworkStatusChanged {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeJoined,
    NodeLeft,
    ConnectionEstablished,
    ConnectionLost,
    MessageReceived,
    MessageDelivered,
    NetworkStatusChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NodeJoined => "node_joined",
            EventKind::NodeLeft => "node_left",
            EventKind::ConnectionEstablished => "connection_established",
            EventKind::ConnectionLost => "connection_lost",
            EventKind::MessageReceived => "message_received",
            EventKind::MessageDelivered => "message_delivered",
            EventKind::NetworkStatusChanged => "network_status_changed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MeshEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MeshEvent::NodeJoined { .. } => EventKind::NodeJoined,
            MeshEvent::NodeLeft { .. } => EventKind::NodeLeft,
            MeshEvent::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            MeshEvent::ConnectionLost { .. } => EventKind::ConnectionLost,
            MeshEvent::MessageReceived { .. } => EventKind::MessageReceived,
            MeshEvent::MessageDelivered { .. } => EventKind::MessageDelivered,
            MeshEvent::NetworkStatusChanged { .. } => EventKind::NetworkStatusChanged,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Error a callback may return; it is logged and otherwise ignored
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

type Callback = Arc<dyn Fn(&MeshEvent) -> Result<(), CallbackError> + Send + Sync>;

enum Sink {
    Callback(Callback),
    Channel(mpsc::Sender<MeshEvent>),
}

struct Subscription {
    id: SubscriptionId,
    kinds: Option<HashSet<EventKind>>,
    sink: Sink,
}

impl Subscription {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }
}

pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: Mutex<u64>,
    channel_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus whose channel subscribers buffer at most `capacity` events
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
            channel_capacity: capacity.max(1),
        }
    }

    fn allocate_id(&self) -> SubscriptionId {
        let mut next = self.next_id.lock();
        *next += 1;
        SubscriptionId(*next)
    }

    /// Register a callback for the given kinds (all kinds when `None`)
    pub fn subscribe<F>(&self, callback: F, kinds: Option<Vec<EventKind>>) -> SubscriptionId
    where
        F: Fn(&MeshEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.subscriptions.lock().push(Subscription {
            id,
            kinds: kinds.map(|k| k.into_iter().collect()),
            sink: Sink::Callback(Arc::new(callback)),
        });
        id
    }

    /// Deliver events into a bounded channel. Events published while the
    /// buffer is full are dropped for this subscriber. The subscription
    /// ends when the receiver is dropped.
    pub fn subscribe_channel(
        &self,
        kinds: Option<Vec<EventKind>>,
    ) -> (SubscriptionId, mpsc::Receiver<MeshEvent>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let id = self.allocate_id();
        self.subscriptions.lock().push(Subscription {
            id,
            kinds: kinds.map(|k| k.into_iter().collect()),
            sink: Sink::Channel(tx),
        });
        (id, rx)
    }

    /// Returns false if the id was unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn publish(&self, event: &MeshEvent) {
        let kind = event.kind();

        // Snapshot callbacks so a subscriber may (un)subscribe from inside
        let mut callbacks = Vec::new();
        {
            let mut subs = self.subscriptions.lock();
            subs.retain(|s| match &s.sink {
                Sink::Channel(tx) => !tx.is_closed(),
                Sink::Callback(_) => true,
            });
            let mut closed = Vec::new();
            for sub in subs.iter().filter(|s| s.wants(kind)) {
                match &sub.sink {
                    Sink::Callback(cb) => callbacks.push((sub.id, Arc::clone(cb))),
                    Sink::Channel(tx) => match tx.try_send(event.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("Subscriber {:?} is full, dropping {}", sub.id, kind)
                        }
                        Err(TrySendError::Closed(_)) => closed.push(sub.id),
                    },
                }
            }
            if !closed.is_empty() {
                subs.retain(|s| !closed.contains(&s.id));
            }
        }

        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Subscriber {:?} failed on {}: {}", id, kind, e),
                Err(_) => warn!("Subscriber {:?} panicked on {}", id, kind),
            }
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = MeshEvent>) {
        for event in events {
            self.publish(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn joined(name: &str) -> MeshEvent {
        MeshEvent::NodeJoined {
            node_id: format!("id-{}", name),
            name: name.to_string(),
        }
    }

    fn left() -> MeshEvent {
        MeshEvent::NodeLeft {
            node_id: "id-x".into(),
        }
    }

    #[test]
    fn test_kind_filter() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Some(vec![EventKind::NodeLeft]),
        );

        bus.publish(&joined("a"));
        bus.publish(&left());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_subscribers_do_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| Err("boom".into()), None);
        bus.subscribe(|_| panic!("subscriber bug"), None);
        let c = Arc::clone(&count);
        bus.subscribe(
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            None,
        );

        bus.publish(&joined("a"));
        bus.publish(&joined("b"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe(
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            None,
        );

        bus.publish(&joined("a"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&joined("b"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let bus = EventBus::new();
        let (_, mut rx) = bus.subscribe_channel(Some(vec![EventKind::NodeJoined]));

        bus.publish(&left());
        bus.publish(&joined("a"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::NodeJoined);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_removes_subscription() {
        let bus = EventBus::new();
        let (_, rx) = bus.subscribe_channel(None);
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx);
        bus.publish(&joined("a"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_full_channel_drops_events_but_keeps_subscriber() {
        let bus = EventBus::with_channel_capacity(2);
        let (_, mut rx) = bus.subscribe_channel(None);

        bus.publish(&joined("a"));
        bus.publish(&joined("b"));
        bus.publish(&joined("c"));
        assert_eq!(bus.subscriber_count(), 1);

        assert_eq!(rx.try_recv().unwrap(), joined("a"));
        assert_eq!(rx.try_recv().unwrap(), joined("b"));
        assert!(rx.try_recv().is_err());

        // Draining frees room for later events
        bus.publish(&joined("d"));
        assert_eq!(rx.try_recv().unwrap(), joined("d"));
    }

    #[test]
    fn test_event_serializes_with_snake_case_tag() {
        let value = serde_json::to_value(joined("a")).unwrap();
        assert_eq!(value["event"], "node_joined");
        assert_eq!(EventKind::NetworkStatusChanged.to_string(), "network_status_changed");
    }
}
