//! # fleetkv
//!
//! Cluster coordination layer for a container orchestration platform:
//! - Gossip membership with peer-table propagation and eviction
//! - Bootstrap from configured seeds and a persisted peer cache
//! - Replicated embedded key-value store (sled) with synchronous push
//!   replication, tombstones, full-state sync and an advisory lock
//! - gRPC for the store and membership APIs, HTTP for admin
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────── node ────────────┐        ┌──────────── node ────────────┐
//!   │  gRPC KvStore / Membership   │◄──────►│  gRPC KvStore / Membership   │
//!   │  ReplicatedStore (sled)      │  push  │  ReplicatedStore (sled)      │
//!   │  MembershipAgent ── gossip ──┼───────►│  MembershipAgent             │
//!   │  PeerBootstrap (seeds+cache) │  TCP   │                              │
//!   └──────────────────────────────┘        └──────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the first node
//! ```bash
//! fleetkv-node serve \
//!   --id node-1 \
//!   --gossip 0.0.0.0:7946 \
//!   --rpc 0.0.0.0:7947 \
//!   --data ./node-1
//! ```
//!
//! ### Join a second node
//! ```bash
//! fleetkv-node serve \
//!   --id node-2 \
//!   --gossip 0.0.0.0:8946 \
//!   --rpc 0.0.0.0:8947 \
//!   --data ./node-2 \
//!   --seeds 127.0.0.1:7946
//! ```
//!
//! ### Use the CLI
//! ```bash
//! fleetkv set routes 10.0.0.0/24 node-1 --sync
//! fleetkv get routes 10.0.0.0/24
//! fleetkv search routes 10.0.
//! fleetkv peers
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod membership;
pub mod node;
pub mod store;

// Re-export commonly used types
pub use common::{Error, NodeConfig, Result};
pub use membership::{MembershipAgent, Peer, PeerBootstrap};
pub use node::{Node, RunningNode};
pub use store::{ReplicatedStore, Store, StoreClient};

// Generated protobuf code
pub mod proto {
    tonic::include_proto!("fleetkv");
}

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
