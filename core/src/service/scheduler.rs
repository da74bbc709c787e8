// Scheduler — per-node discovery and heartbeat tasks
//
// Each joined node gets two interval tasks. They hold only a weak handle
// to the shared state and stop on their own once their node is gone; the
// scheduler aborts them on leave, shutdown and drop.

use super::{discovery_pass, heartbeat, Shared};
use crate::node::NodeId;
use crate::MeshError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

struct NodeTasks {
    discovery: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl NodeTasks {
    fn abort(&self) {
        self.discovery.abort();
        self.heartbeat.abort();
    }
}

#[derive(Default)]
pub(crate) struct Scheduler {
    tasks: Mutex<HashMap<NodeId, NodeTasks>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start a node's tasks. Returns false when no tokio runtime is available.
    pub(crate) fn start(&self, shared: &Arc<Shared>, node_id: &str) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; node {} runs without schedules", node_id);
            return false;
        };

        let discovery = handle.spawn(discovery_loop(Arc::downgrade(shared), node_id.to_string()));
        let heartbeat = handle.spawn(heartbeat_loop(Arc::downgrade(shared), node_id.to_string()));

        if let Some(previous) = self
            .tasks
            .lock()
            .insert(node_id.to_string(), NodeTasks { discovery, heartbeat })
        {
            previous.abort();
        }
        debug!("Schedules started for {}", node_id);
        true
    }

    pub(crate) fn cancel(&self, node_id: &str) {
        if let Some(tasks) = self.tasks.lock().remove(node_id) {
            tasks.abort();
            debug!("Schedules cancelled for {}", node_id);
        }
    }

    pub(crate) fn cancel_all(&self) {
        for (_, tasks) in self.tasks.lock().drain() {
            tasks.abort();
        }
    }

    pub(crate) fn is_scheduled(&self, node_id: &str) -> bool {
        self.tasks.lock().contains_key(node_id)
    }

    pub(crate) fn scheduled_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn discovery_loop(shared: Weak<Shared>, node_id: NodeId) {
    let period = match shared.upgrade() {
        Some(shared) => shared.config.discovery_interval(),
        None => return,
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match discovery_pass(&shared, &node_id).await {
            Ok(result) => debug!(
                "Scan from {}: {} in range, {} new links",
                node_id,
                result.nodes_discovered.len(),
                result.new_connections.len()
            ),
            Err(MeshError::NodeNotFound(_)) => break,
            Err(e) => warn!("Discovery from {} failed: {}", node_id, e),
        }
    }
}

async fn heartbeat_loop(shared: Weak<Shared>, node_id: NodeId) {
    let period = match shared.upgrade() {
        Some(shared) => shared.config.heartbeat_interval(),
        None => return,
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; the first beat is one period in
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match heartbeat::beat(&shared, &node_id).await {
            Ok(_) => {}
            Err(MeshError::NodeNotFound(_)) => break,
            Err(e) => warn!("Heartbeat from {} failed: {}", node_id, e),
        }
    }
}
