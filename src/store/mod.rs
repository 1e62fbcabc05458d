//! Replicated embedded key-value store
//!
//! - `engine`: sled-backed buckets, tombstones, peer cache, backup/restore
//! - `lock`: the store-wide advisory lock
//! - `replicated`: synchronous push replication and maintenance tickers
//! - `sync`: applying a peer's full dump
//! - `client`: tonic clients, including the peer transport

pub mod client;
pub mod engine;
pub mod lock;
pub mod replicated;
pub mod sync;

pub use client::{endpoint_uri, GrpcPeerTransport, StoreClient};
pub use engine::{DumpEntry, KeyValue, Store, Tombstone, PEER_CACHE_TREE, TOMBSTONE_TREE};
pub use lock::AdvisoryLock;
pub use replicated::{MaintenanceConfig, PeerSource, PeerTransport, ReplicatedStore, SyncStream};
pub use sync::SyncReport;
