//! Gossip-based cluster membership
//!
//! Architecture:
//! - `transport`: TCP push-pull gossip, member tracking, graceful leave
//! - `delegate`: hooks the transport calls, implemented by `MembershipState`
//! - `directory`: the in-memory peer table
//! - `agent`: loops for gossip rounds, reconciliation and meta refresh
//! - `bootstrap`: picks the initial contact set from seeds and the peer cache

pub mod agent;
pub mod bootstrap;
pub mod delegate;
pub mod directory;
pub mod transport;

pub use agent::{advertise_address, MembershipAgent, MembershipConfig};
pub use bootstrap::{LivenessProbe, PeerBootstrap, TcpProbe};
pub use delegate::{GossipDelegate, GossipState, MembershipEvent, MembershipState};
pub use directory::{Peer, PeerDirectory};
pub use transport::{GossipTransport, NodeInfo, TransportConfig};
