// Loopback transport — deterministic in-process links
//
// Every pair of nodes can reach each other unless a link is severed or a
// node is marked unreachable. Latency and signal come from the link
// profile plus seeded jitter, so runs are reproducible.

use super::abstraction::{LinkMetrics, LinkProfile, LinkType, Transport, TransportError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// A frame that left one node for another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub from: String,
    pub to: String,
    pub link: LinkType,
    pub bytes: Vec<u8>,
}

pub struct LoopbackTransport {
    /// Severed pairs, stored with the smaller id first
    severed: RwLock<HashSet<(String, String)>>,
    unreachable: RwLock<HashSet<String>>,
    frames: RwLock<Vec<FrameRecord>>,
    rng: Mutex<StdRng>,
    /// Maximum extra latency added per measurement
    jitter_ms: u32,
}

impl LoopbackTransport {
    /// Transport with no jitter
    pub fn new() -> Self {
        Self::with_jitter(0, 0)
    }

    /// Transport with seeded latency jitter in `0..=jitter_ms`
    pub fn with_jitter(seed: u64, jitter_ms: u32) -> Self {
        Self {
            severed: RwLock::new(HashSet::new()),
            unreachable: RwLock::new(HashSet::new()),
            frames: RwLock::new(Vec::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            jitter_ms,
        }
    }

    fn pair(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    /// Make the link between two nodes fail in both directions
    pub fn sever(&self, a: &str, b: &str) {
        self.severed.write().insert(Self::pair(a, b));
    }

    pub fn restore(&self, a: &str, b: &str) {
        self.severed.write().remove(&Self::pair(a, b));
    }

    /// Make every call to or from a node fail
    pub fn set_unreachable(&self, node_id: &str, unreachable: bool) {
        let mut set = self.unreachable.write();
        if unreachable {
            set.insert(node_id.to_string());
        } else {
            set.remove(node_id);
        }
    }

    /// All frames sent so far, in send order
    pub fn frames(&self) -> Vec<FrameRecord> {
        self.frames.read().clone()
    }

    /// Frames sent from `from` to `to`, in send order
    pub fn frames_between(&self, from: &str, to: &str) -> Vec<Vec<u8>> {
        self.frames
            .read()
            .iter()
            .filter(|f| f.from == from && f.to == to)
            .map(|f| f.bytes.clone())
            .collect()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.read().len()
    }

    fn check_path(&self, from: &str, to: &str) -> Result<(), String> {
        let unreachable = self.unreachable.read();
        if unreachable.contains(from) || unreachable.contains(to) {
            return Err(format!("{} -> {} unreachable", from, to));
        }
        if self.severed.read().contains(&Self::pair(from, to)) {
            return Err(format!("{} -> {} severed", from, to));
        }
        Ok(())
    }

    fn measure(&self, link: LinkType) -> LinkMetrics {
        let profile = LinkProfile::for_link(link);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            self.rng.lock().gen_range(0..=self.jitter_ms)
        };
        LinkMetrics {
            latency_ms: profile.estimated_latency_ms + jitter,
            signal_strength_dbm: profile.typical_signal_dbm - (jitter / 10) as i32,
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, from: &str, to: &str, link: LinkType) -> Result<LinkMetrics, TransportError> {
        self.check_path(from, to)
            .map_err(TransportError::ConnectionFailed)?;
        Ok(self.measure(link))
    }

    async fn send(&self, from: &str, to: &str, link: LinkType, frame: &[u8]) -> Result<(), TransportError> {
        self.check_path(from, to).map_err(TransportError::SendFailed)?;
        self.frames.write().push(FrameRecord {
            from: from.to_string(),
            to: to.to_string(),
            link,
            bytes: frame.to_vec(),
        });
        Ok(())
    }

    async fn probe(&self, from: &str, to: &str) -> Result<LinkMetrics, TransportError> {
        self.check_path(from, to).map_err(TransportError::PeerNotFound)?;
        Ok(self.measure(LinkType::Bluetooth))
    }
}
