// Replication status of sibling registry nodes

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerHealth {
    Healthy,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    pub address: String,
    pub health: PeerHealth,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Wall time (ms) of the last successful exchange
    pub last_contact_ms: Option<u64>,
}

impl PeerNode {
    fn new(address: String) -> Self {
        Self {
            address,
            health: PeerHealth::Healthy,
            last_error: None,
            consecutive_failures: 0,
            last_contact_ms: None,
        }
    }
}

/// The static peer set. Readable by anyone, updated only by replication.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: DashMap<String, PeerNode>,
}

impl PeerSet {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let peers = DashMap::new();
        for address in addresses {
            let address = address.into();
            peers.insert(address.clone(), PeerNode::new(address));
        }
        Self { peers }
    }

    /// Peer addresses in stable order
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.peers.iter().map(|p| p.key().clone()).collect();
        addresses.sort();
        addresses
    }

    pub fn get(&self, address: &str) -> Option<PeerNode> {
        self.peers.get(address).map(|p| p.clone())
    }

    pub fn list(&self) -> Vec<PeerNode> {
        let mut peers: Vec<PeerNode> = self.peers.iter().map(|p| p.clone()).collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Returns true when the peer was unreachable before this call
    pub fn mark_healthy(&self, address: &str, now_ms: u64) -> bool {
        let Some(mut peer) = self.peers.get_mut(address) else {
            return false;
        };
        let recovered = peer.health == PeerHealth::Unreachable;
        peer.health = PeerHealth::Healthy;
        peer.consecutive_failures = 0;
        peer.last_error = None;
        peer.last_contact_ms = Some(now_ms);
        recovered
    }

    /// Returns true when the peer was healthy before this call
    pub fn mark_unreachable(&self, address: &str, reason: &str) -> bool {
        let Some(mut peer) = self.peers.get_mut(address) else {
            return false;
        };
        let lost = peer.health == PeerHealth::Healthy;
        peer.health = PeerHealth::Unreachable;
        peer.consecutive_failures = peer.consecutive_failures.saturating_add(1);
        peer.last_error = Some(reason.to_string());
        lost
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
