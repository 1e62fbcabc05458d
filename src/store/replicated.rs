//! Replicated store: local engine plus best-effort synchronous push to the
//! peers known at call time.

use crate::common::{timestamp_now_millis, Error, Result, METRICS};
use crate::membership::Peer;
use crate::proto::{DeleteRequest, SetRequest, SyncEntry};
use crate::store::engine::{DumpEntry, KeyValue, Store};
use crate::store::lock::AdvisoryLock;
use crate::store::sync::{apply_stream, SyncReport};
use futures_util::stream::BoxStream;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Entries of a peer's `Sync` stream.
pub type SyncStream = BoxStream<'static, Result<SyncEntry>>;

/// Replication targets. Read on every replicated write.
pub trait PeerSource: Send + Sync {
    fn current_peers(&self) -> Vec<Peer>;
}

/// Remote calls the replicated store makes against a peer's RPC address.
#[tonic::async_trait]
pub trait PeerTransport: Send + Sync {
    async fn set(&self, address: &str, request: SetRequest) -> Result<()>;

    async fn delete(&self, address: &str, request: DeleteRequest) -> Result<()>;

    async fn sync(&self, address: &str) -> Result<SyncStream>;
}

enum PeerWrite {
    Set(SetRequest),
    Delete(DeleteRequest),
}

/// Intervals for the background maintenance tasks.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceConfig {
    pub prune_interval: Duration,
    pub tombstone_ttl: Duration,
    /// `None` disables periodic peer sync.
    pub sync_interval: Option<Duration>,
}

pub struct ReplicatedStore {
    store: Arc<Store>,
    lock: AdvisoryLock,
    peers: Arc<dyn PeerSource>,
    transport: Arc<dyn PeerTransport>,
}

impl ReplicatedStore {
    pub fn new(
        store: Arc<Store>,
        peers: Arc<dyn PeerSource>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            store,
            lock: AdvisoryLock::new(),
            peers,
            transport,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.store.create_bucket(bucket)
    }

    /// Write locally, then, with `sync`, push the same write to every known
    /// peer. A replication failure is returned but the local write stays.
    pub async fn set(&self, bucket: &str, key: &str, value: &[u8], sync: bool) -> Result<()> {
        self.store.set(bucket, key, value)?;
        if sync {
            self.replicate(PeerWrite::Set(SetRequest {
                bucket: bucket.to_string(),
                key: key.to_string(),
                value: value.to_vec(),
                sync: false,
            }))
            .await?;
        }
        Ok(())
    }

    pub async fn delete(&self, bucket: &str, key: &str, sync: bool) -> Result<()> {
        self.store.delete(bucket, key)?;
        if sync {
            self.replicate(PeerWrite::Delete(DeleteRequest {
                bucket: bucket.to_string(),
                key: key.to_string(),
                sync: false,
            }))
            .await?;
        }
        Ok(())
    }

    pub fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.store.get(bucket, key)
    }

    pub fn search(&self, bucket: &str, prefix: &str) -> Result<Vec<KeyValue>> {
        self.store.search(bucket, prefix)
    }

    /// Take the advisory lock; it is released after `timeout` unless
    /// [`release_lock`](Self::release_lock) comes first.
    pub async fn acquire_lock(&self, timeout: Duration) -> Result<()> {
        self.lock.acquire(timeout).await
    }

    pub fn release_lock(&self) -> bool {
        self.lock.release()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub async fn backup(&self) -> Result<Vec<u8>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.backup())
            .await
            .map_err(|e| Error::Internal(format!("backup task: {}", e)))?
    }

    pub async fn restore(&self, snapshot: Vec<u8>) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.restore(&snapshot))
            .await
            .map_err(|e| Error::Internal(format!("restore task: {}", e)))?
    }

    pub fn dump(&self) -> Result<Vec<DumpEntry>> {
        self.store.dump()
    }

    /// Pull the full state of the peer at `address` and replay it locally
    /// without replication.
    pub async fn peer_sync(&self, address: &str) -> Result<SyncReport> {
        info!(peer = address, "starting peer sync");
        let entries = self.transport.sync(address).await?;
        let report = apply_stream(&self.store, entries).await?;
        METRICS.peer_syncs.inc();
        METRICS.entries_synced.add(report.applied as u64);
        info!(
            peer = address,
            applied = report.applied,
            skipped = report.skipped,
            tombstones = report.tombstones,
            "peer sync complete"
        );
        Ok(report)
    }

    pub fn prune(&self, ttl: Duration) -> Result<usize> {
        let pruned = self.store.prune_tombstones(timestamp_now_millis(), ttl)?;
        METRICS.tombstones_pruned.add(pruned as u64);
        Ok(pruned)
    }

    async fn replicate(&self, write: PeerWrite) -> Result<()> {
        let peers = self.peers.current_peers();
        for peer in peers {
            let result = match &write {
                PeerWrite::Set(request) => {
                    self.transport.set(&peer.rpc_address, request.clone()).await
                }
                PeerWrite::Delete(request) => {
                    self.transport.delete(&peer.rpc_address, request.clone()).await
                }
            };
            match result {
                Ok(()) => {
                    METRICS.replication_pushes.inc();
                    debug!(peer = %peer.id, "replicated write");
                }
                Err(e) => {
                    METRICS.replication_failures.inc();
                    warn!(peer = %peer.id, address = %peer.rpc_address, "replication failed: {}", e);
                    return Err(Error::Replication {
                        peer: peer.id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Spawn the tombstone prune ticker and, if enabled, the periodic sync
    /// ticker. Both stop when `shutdown` flips.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        config: MaintenanceConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![tokio::spawn(prune_loop(
            self.clone(),
            config.prune_interval,
            config.tombstone_ttl,
            shutdown.clone(),
        ))];
        if let Some(interval) = config.sync_interval {
            tasks.push(tokio::spawn(sync_loop(self.clone(), interval, shutdown)));
        }
        tasks
    }
}

async fn prune_loop(
    store: Arc<ReplicatedStore>,
    interval: Duration,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.prune(ttl) {
                    warn!("tombstone prune failed: {}", e);
                }
            }
        }
    }
}

async fn sync_loop(
    store: Arc<ReplicatedStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let target = store
                    .peers
                    .current_peers()
                    .choose(&mut rand::thread_rng())
                    .cloned();
                if let Some(peer) = target {
                    if let Err(e) = store.peer_sync(&peer.rpc_address).await {
                        warn!(peer = %peer.id, "periodic sync failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream::{self, StreamExt};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct StaticPeers(Vec<Peer>);

    impl PeerSource for StaticPeers {
        fn current_peers(&self) -> Vec<Peer> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        down: HashSet<String>,
        sets: Mutex<Vec<(String, SetRequest)>>,
        deletes: Mutex<Vec<(String, DeleteRequest)>>,
        dump: Vec<SyncEntry>,
    }

    #[tonic::async_trait]
    impl PeerTransport for FakeTransport {
        async fn set(&self, address: &str, request: SetRequest) -> Result<()> {
            if self.down.contains(address) {
                return Err(Error::ConnectionFailed(address.to_string()));
            }
            self.sets.lock().unwrap().push((address.to_string(), request));
            Ok(())
        }

        async fn delete(&self, address: &str, request: DeleteRequest) -> Result<()> {
            if self.down.contains(address) {
                return Err(Error::ConnectionFailed(address.to_string()));
            }
            self.deletes.lock().unwrap().push((address.to_string(), request));
            Ok(())
        }

        async fn sync(&self, address: &str) -> Result<SyncStream> {
            if self.down.contains(address) {
                return Err(Error::ConnectionFailed(address.to_string()));
            }
            Ok(stream::iter(self.dump.clone().into_iter().map(Ok)).boxed())
        }
    }

    fn peers(ids: &[&str]) -> Arc<StaticPeers> {
        Arc::new(StaticPeers(
            ids.iter()
                .map(|id| Peer::new(*id, format!("{}:7946", id), format!("{}:7947", id)))
                .collect(),
        ))
    }

    fn replicated(
        peers: Arc<StaticPeers>,
        transport: Arc<FakeTransport>,
    ) -> (TempDir, ReplicatedStore) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("store"), Duration::from_secs(1)).unwrap());
        (dir, ReplicatedStore::new(store, peers, transport))
    }

    #[tokio::test]
    async fn test_sync_set_reaches_every_peer() {
        let transport = Arc::new(FakeTransport::default());
        let (_dir, store) = replicated(peers(&["b", "c"]), transport.clone());

        store
            .set("routes", "10.0.0.0/24", b"node-1", true)
            .await
            .unwrap();

        let sets = transport.sets.lock().unwrap();
        assert_eq!(sets.len(), 2);
        assert!(sets.iter().all(|(_, req)| !req.sync && req.value == b"node-1"));
        assert_eq!(sets[0].0, "b:7947");
        assert_eq!(sets[1].0, "c:7947");
    }

    #[tokio::test]
    async fn test_failed_peer_keeps_local_write() {
        let transport = Arc::new(FakeTransport {
            down: ["c:7947".to_string()].into_iter().collect(),
            ..Default::default()
        });
        let (_dir, store) = replicated(peers(&["b", "c"]), transport);

        let err = store
            .set("routes", "10.0.0.0/24", b"node-1", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Replication { ref peer, .. } if peer == "c"));
        assert_eq!(store.get("routes", "10.0.0.0/24").unwrap(), b"node-1");
    }

    #[tokio::test]
    async fn test_unsynced_write_stays_local() {
        let transport = Arc::new(FakeTransport::default());
        let (_dir, store) = replicated(peers(&["b"]), transport.clone());
        store.set("routes", "r", b"1", false).await.unwrap();
        store.delete("routes", "r", false).await.unwrap();
        assert!(transport.sets.lock().unwrap().is_empty());
        assert!(transport.deletes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_delete_replicates() {
        let transport = Arc::new(FakeTransport::default());
        let (_dir, store) = replicated(peers(&["b"]), transport.clone());
        store.set("dns", "web", b"10.0.0.5", false).await.unwrap();
        store.delete("dns", "web", true).await.unwrap();

        let deletes = transport.deletes.lock().unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].1.key, "web");
        assert!(store.store().tombstone("dns", "web").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_peer_sync_applies_dump() {
        let entry = |bucket: &str, key: &str, value: &[u8]| SyncEntry {
            bucket: bucket.into(),
            key: key.into(),
            value: value.to_vec(),
            tombstone: false,
            deleted_at: 0,
        };
        let transport = Arc::new(FakeTransport {
            dump: vec![
                entry("apps", "web", b"3"),
                entry("apps", "db", b"1"),
                SyncEntry {
                    bucket: "apps".into(),
                    key: "old".into(),
                    value: Vec::new(),
                    tombstone: true,
                    deleted_at: 77,
                },
            ],
            ..Default::default()
        });
        let (_dir, store) = replicated(peers(&[]), transport.clone());
        store.create_bucket("apps").unwrap();
        store.delete("apps", "db", false).await.unwrap();

        let report = store.peer_sync("b:7947").await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.tombstones, 1);
        assert_eq!(store.get("apps", "web").unwrap(), b"3");
        assert!(store.get("apps", "db").unwrap().is_empty());
        // nothing was pushed back out
        assert!(transport.sets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_counts() {
        let (_dir, store) = replicated(peers(&[]), Arc::new(FakeTransport::default()));
        store.create_bucket("dns").unwrap();
        store.delete("dns", "a", false).await.unwrap();
        assert_eq!(store.prune(Duration::from_secs(90)).unwrap(), 0);
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.prune(Duration::from_millis(1)).unwrap(), 1);
    }
}
