//! In-memory peer table maintained by gossip

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// A cluster peer as seen through gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable node identifier.
    pub id: String,
    /// Gossip endpoint (host:port); also what the peer cache persists.
    pub address: String,
    /// Store/membership RPC endpoint.
    pub rpc_address: String,
    /// Unix milliseconds of the last merge of this peer's state.
    pub last_seen: u64,
}

impl Peer {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        rpc_address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            rpc_address: rpc_address.into(),
            last_seen: 0,
        }
    }
}

/// Peer table keyed by node id. Never holds the local node.
pub struct PeerDirectory {
    local_id: String,
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerDirectory {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Insert or refresh a peer. Returns false if the entry names the local node.
    pub fn upsert(&self, peer: Peer) -> bool {
        if peer.id == self.local_id {
            return false;
        }
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(peer.id.clone(), peer);
        true
    }

    pub fn remove(&self, id: &str) -> Option<Peer> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// All peers, sorted by id for stable output.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every peer whose `last_seen + timeout` lies before `now` (both in
    /// unix milliseconds). Returns the evicted peers.
    pub fn evict_stale(&self, now: u64, timeout: Duration) -> Vec<Peer> {
        let timeout_ms = timeout.as_millis() as u64;
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let stale: Vec<String> = peers
            .values()
            .filter(|p| now > p.last_seen.saturating_add(timeout_ms))
            .map(|p| p.id.clone())
            .collect();
        stale.iter().filter_map(|id| peers.remove(id)).collect()
    }
}
