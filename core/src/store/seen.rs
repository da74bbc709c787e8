// Seen cache — per-node message-id dedupe for flooding
//
// A node that has seen an id neither reprocesses nor relays it. The set is
// bounded; once full, the oldest ids are forgotten first.

use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone)]
pub struct SeenCache {
    /// Set of seen message IDs (for dedup)
    ids: HashSet<String>,
    /// Insertion order (for O(1) FIFO eviction)
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an id. Returns false if it was already known.
    pub fn insert(&mut self, message_id: &str) -> bool {
        if self.ids.contains(message_id) {
            return false;
        }

        self.ids.insert(message_id.to_string());
        self.order.push_back(message_id.to_string());

        while self.ids.len() > self.capacity {
            if let Some(old_id) = self.order.pop_front() {
                self.ids.remove(&old_id);
            }
        }
        true
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut seen = SeenCache::new(10);
        assert!(seen.insert("msg-1"));
        assert!(!seen.insert("msg-1"));
        assert!(seen.contains("msg-1"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut seen = SeenCache::new(3);
        for id in ["a", "b", "c", "d"] {
            seen.insert(id);
        }

        assert_eq!(seen.len(), 3);
        assert!(!seen.contains("a"));
        assert!(seen.contains("d"));
        // An evicted id is accepted again
        assert!(seen.insert("a"));
        assert!(!seen.contains("b"));
    }
}
