// Store-and-forward queue — custody of unicasts that have no route yet
//
// Entries are grouped by target. A drain pass takes the due entries,
// retries them, and reports back: delivered entries are removed, failed
// ones are rescheduled with exponential backoff until attempts run out.

use crate::config::QueueConfig;
use crate::message::{Message, MessageId};
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue full ({0} messages)")]
    Full(usize),
    #[error("Queue full for target {target} ({max} messages)")]
    TargetFull { target: NodeId, max: usize },
}

/// A message waiting for a route to its target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub message: Message,
    /// Destination not yet reached
    pub target_id: NodeId,
    /// Node currently holding the message
    pub custodian_id: NodeId,
    pub attempts: u32,
    pub last_attempt: Option<u64>,
    /// Earliest retry time (Unix ms)
    pub next_attempt: u64,
    pub queued_at: u64,
}

impl QueuedMessage {
    pub fn new(message: Message, custodian_id: NodeId, now: u64) -> Self {
        Self {
            target_id: message.destination_id.clone(),
            message,
            custodian_id,
            attempts: 0,
            last_attempt: None,
            next_attempt: now,
            queued_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn is_due(&self, now: u64) -> bool {
        self.next_attempt <= now
    }
}

/// Exponential backoff: `base × 2^attempts`, capped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for RetryStrategy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryStrategy {
    /// Delay before the next try, after `attempts` failures
    pub fn calculate_delay(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Should we retry after this many attempts?
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// What happened to an entry after a failed retry
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Rescheduled { attempts: u32, next_attempt: u64 },
    /// Out of attempts; the entry has been removed
    Exhausted(QueuedMessage),
}

#[derive(Debug)]
pub struct StoreAndForwardQueue {
    queues: HashMap<NodeId, VecDeque<QueuedMessage>>,
    total: usize,
    strategy: RetryStrategy,
    max_per_target: usize,
    max_total: usize,
}

impl Default for StoreAndForwardQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

impl StoreAndForwardQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            queues: HashMap::new(),
            total: 0,
            strategy: RetryStrategy::from(config),
            max_per_target: config.max_per_target,
            max_total: config.max_total,
        }
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    /// Take custody of a message. Returns false if it is already queued.
    pub fn enqueue(&mut self, entry: QueuedMessage) -> Result<bool, QueueError> {
        if self.contains(entry.id()) {
            return Ok(false);
        }
        if self.total >= self.max_total {
            return Err(QueueError::Full(self.max_total));
        }

        let queue = self.queues.entry(entry.target_id.clone()).or_default();
        if queue.len() >= self.max_per_target {
            return Err(QueueError::TargetFull {
                target: entry.target_id.clone(),
                max: self.max_per_target,
            });
        }

        debug!(
            "Queued message {} for {} at custodian {}",
            entry.message.id, entry.target_id, entry.custodian_id
        );
        queue.push_back(entry);
        self.total += 1;
        Ok(true)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.get(message_id).is_some()
    }

    pub fn get(&self, message_id: &str) -> Option<&QueuedMessage> {
        self.queues
            .values()
            .flat_map(|q| q.iter())
            .find(|e| e.message.id == message_id)
    }

    pub fn get_mut(&mut self, message_id: &str) -> Option<&mut QueuedMessage> {
        self.queues
            .values_mut()
            .flat_map(|q| q.iter_mut())
            .find(|e| e.message.id == message_id)
    }

    /// Entries ready for a retry, highest priority first, then oldest first
    pub fn due(&self, now: u64) -> Vec<QueuedMessage> {
        let mut due: Vec<QueuedMessage> = self
            .queues
            .values()
            .flat_map(|q| q.iter())
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.message
                .priority
                .cmp(&a.message.priority)
                .then(a.queued_at.cmp(&b.queued_at))
        });
        due
    }

    /// Remove an entry (after successful delivery)
    pub fn remove(&mut self, message_id: &str) -> Option<QueuedMessage> {
        let mut removed = None;
        for queue in self.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|e| e.message.id == message_id) {
                removed = queue.remove(pos);
                break;
            }
        }
        if removed.is_some() {
            self.total -= 1;
            self.queues.retain(|_, q| !q.is_empty());
        }
        removed
    }

    /// Count a failed retry and reschedule, or drop once attempts run out
    pub fn record_failure(&mut self, message_id: &str, now: u64) -> Option<RetryDecision> {
        let strategy = self.strategy.clone();
        let entry = self.get_mut(message_id)?;
        entry.attempts += 1;
        entry.last_attempt = Some(now);

        if !strategy.should_retry(entry.attempts) {
            debug!(
                "Message {} dropped after {} attempts",
                message_id, entry.attempts
            );
            return self.remove(message_id).map(RetryDecision::Exhausted);
        }

        let delay = strategy.calculate_delay(entry.attempts).as_millis() as u64;
        entry.next_attempt = now.saturating_add(delay);
        Some(RetryDecision::Rescheduled {
            attempts: entry.attempts,
            next_attempt: entry.next_attempt,
        })
    }

    /// Drop entries whose message has expired
    pub fn remove_expired(&mut self, now: u64) -> Vec<QueuedMessage> {
        self.remove_where(|e| e.message.is_expired(now))
    }

    /// Drop entries held by, or addressed to, a departing node
    pub fn remove_node(&mut self, node_id: &str) -> Vec<QueuedMessage> {
        self.remove_where(|e| e.custodian_id == node_id || e.target_id == node_id)
    }

    fn remove_where(&mut self, pred: impl Fn(&QueuedMessage) -> bool) -> Vec<QueuedMessage> {
        let mut removed = Vec::new();
        for queue in self.queues.values_mut() {
            let (gone, kept): (VecDeque<_>, VecDeque<_>) = queue.drain(..).partition(|e| pred(e));
            *queue = kept;
            removed.extend(gone);
        }
        self.total -= removed.len();
        self.queues.retain(|_, q| !q.is_empty());
        removed
    }

    /// Get all queued messages for a target (without removing them)
    pub fn peek_for_target(&self, target_id: &str) -> Vec<QueuedMessage> {
        self.queues
            .get(target_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every queued entry, in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.queues.values().flat_map(|q| q.iter())
    }

    pub fn target_count(&self, target_id: &str) -> usize {
        self.queues.get(target_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn total_count(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}
