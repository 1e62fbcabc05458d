//! Gossip delegate: the hooks the transport calls into, and the membership
//! state that implements them.

use crate::common::{timestamp_now_millis, Result, METRICS};
use crate::membership::directory::{Peer, PeerDirectory};
use crate::membership::transport::NodeInfo;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Capacity of the lifecycle event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// Hooks a gossip transport invokes on the owning node.
///
/// Implementations must not block: the transport calls these from its
/// connection handlers.
pub trait GossipDelegate: Send + Sync {
    /// Metadata advertised for the local node, at most `limit` bytes.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// Full local state sent during a push-pull exchange.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Merge one remote node's state. Undecodable input is discarded.
    fn merge_remote_state(&self, buf: &[u8], join: bool);

    fn notify_join(&self, node: &NodeInfo);

    fn notify_leave(&self, node: &NodeInfo);

    fn notify_update(&self, node: &NodeInfo);
}

/// Payload exchanged as node meta and push-pull state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipState {
    /// The sender itself.
    pub node: Peer,
    /// The sender's peer directory.
    pub peers: Vec<Peer>,
}

impl GossipState {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

/// Node lifecycle events observed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeInfo),
    Left(NodeInfo),
    Updated(NodeInfo),
}

/// Membership state shared between the gossip transport and the agent.
pub struct MembershipState {
    local: Peer,
    directory: PeerDirectory,
    updates: watch::Sender<u64>,
    events_tx: mpsc::Sender<MembershipEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<MembershipEvent>>>,
}

impl MembershipState {
    pub fn new(local: Peer) -> Self {
        let (updates, _) = watch::channel(0);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            directory: PeerDirectory::new(local.id.clone()),
            local,
            updates,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn local_peer(&self) -> Peer {
        self.local.clone()
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    /// Receiver for the peer-update signal. The value is a generation
    /// counter; only changes matter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    /// Take the lifecycle event queue. There is a single consumer: the
    /// second call returns `None`.
    pub fn take_events(&self) -> Option<mpsc::Receiver<MembershipEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Fire the peer-update signal. Never blocks, even with no receivers.
    pub fn signal_update(&self) {
        METRICS.known_peers.set(self.directory.len() as u64);
        self.updates.send_modify(|generation| {
            *generation = generation.wrapping_add(1);
        });
    }

    fn snapshot_state(&self) -> GossipState {
        let mut node = self.local.clone();
        node.last_seen = timestamp_now_millis();
        GossipState {
            node,
            peers: self.directory.snapshot(),
        }
    }

    fn dispatch(&self, event: MembershipEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(?event, "membership event queue full, dropping event");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

impl GossipDelegate for MembershipState {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        let mut state = self.snapshot_state();
        loop {
            match state.encode() {
                Ok(buf) if buf.len() <= limit || state.peers.is_empty() => {
                    if buf.len() > limit {
                        warn!(size = buf.len(), limit, "node meta exceeds limit");
                    }
                    return buf;
                }
                Ok(_) => {
                    state.peers.pop();
                }
                Err(e) => {
                    warn!("failed to encode node meta: {}", e);
                    return Vec::new();
                }
            }
        }
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        match self.snapshot_state().encode() {
            Ok(buf) => buf,
            Err(e) => {
                warn!("failed to encode local state: {}", e);
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        let remote = match GossipState::decode(buf) {
            Ok(state) => state,
            Err(e) => {
                METRICS.gossip_decode_errors.inc();
                warn!(join, "discarding undecodable remote state: {}", e);
                return;
            }
        };

        let mut peer = remote.node;
        if peer.id == self.local.id {
            return;
        }
        peer.last_seen = timestamp_now_millis();
        debug!(peer = %peer.id, address = %peer.address, join, "merged remote state");
        self.directory.upsert(peer);
        METRICS.gossip_merges.inc();
        self.signal_update();
    }

    fn notify_join(&self, node: &NodeInfo) {
        debug!(peer = %node.id, address = %node.address, "node joined");
        self.dispatch(MembershipEvent::Joined(node.clone()));
    }

    fn notify_leave(&self, node: &NodeInfo) {
        if self.directory.remove(&node.id).is_some() {
            self.signal_update();
        }
        debug!(peer = %node.id, "node left");
        self.dispatch(MembershipEvent::Left(node.clone()));
    }

    fn notify_update(&self, node: &NodeInfo) {
        self.dispatch(MembershipEvent::Updated(node.clone()));
    }
}
