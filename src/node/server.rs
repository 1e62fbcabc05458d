//! Node process wiring

use crate::common::{NodeConfig, Result};
use crate::membership::{
    advertise_address, MembershipAgent, MembershipConfig, MembershipEvent, PeerBootstrap,
};
use crate::node::grpc::{KvStoreService, MembershipService};
use crate::node::http::{create_router, AdminState};
use crate::store::{GrpcPeerTransport, MaintenanceConfig, ReplicatedStore, Store};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{error, info, warn};

pub struct Node {
    config: NodeConfig,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Run until Ctrl-C, then leave the cluster and stop.
    pub async fn serve(self) -> Result<()> {
        let node = self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("shutdown requested");
        node.shutdown().await
    }

    /// Open the store, join the cluster and spawn every service.
    pub async fn start(self) -> Result<RunningNode> {
        let config = self.config;
        config.validate()?;
        info!("Starting node: {}", config.node_id);
        info!("  Gossip: {}", config.gossip_addr);
        info!("  gRPC API: {}", config.rpc_addr);
        info!("  Data dir: {}", config.data_dir.display());

        let store = Arc::new(Store::open(config.store_path(), config.open_timeout())?);

        let rpc_listener = TcpListener::bind(config.rpc_addr).await?;
        let rpc_addr = advertise_address(rpc_listener.local_addr()?, config.advertise_rpc_addr);

        let agent =
            MembershipAgent::start(MembershipConfig::from_node_config(&config, rpc_addr.to_string()))
                .await?;

        if let Err(e) = bootstrap(&config, &store, &agent).await {
            if let Err(leave) = agent.shutdown().await {
                warn!("membership shutdown after failed bootstrap: {}", leave);
            }
            return Err(e);
        }

        let replicated = Arc::new(ReplicatedStore::new(
            store.clone(),
            agent.clone(),
            Arc::new(GrpcPeerTransport::new(config.rpc_timeout())),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let grpc = tonic::transport::Server::builder()
            .add_service(KvStoreService::new(replicated.clone()).into_server())
            .add_service(MembershipService::new(agent.clone()).into_server())
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(rpc_listener),
                wait_for_shutdown(shutdown_rx.clone()),
            );
        tasks.push(tokio::spawn(async move {
            if let Err(e) = grpc.await {
                error!("gRPC server error: {}", e);
            }
        }));

        let http_addr = match config.http_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let bound = listener.local_addr()?;
                let router = create_router(AdminState {
                    agent: agent.clone(),
                    store: replicated.clone(),
                });
                let shutdown = wait_for_shutdown(shutdown_rx.clone());
                tasks.push(tokio::spawn(async move {
                    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown);
                    if let Err(e) = server.await {
                        error!("HTTP server error: {}", e);
                    }
                }));
                info!("  Admin HTTP: {}", bound);
                Some(bound)
            }
            None => None,
        };

        tasks.extend(replicated.spawn_maintenance(
            MaintenanceConfig {
                prune_interval: config.prune_interval(),
                tombstone_ttl: config.tombstone_ttl(),
                sync_interval: config.sync_interval(),
            },
            shutdown_rx.clone(),
        ));
        tasks.push(tokio::spawn(peer_cache_loop(
            agent.clone(),
            store.clone(),
            shutdown_rx.clone(),
        )));
        if let Some(events) = agent.take_events() {
            tasks.push(tokio::spawn(event_log_loop(events, shutdown_rx)));
        }

        info!("✓ Node {} ready", config.node_id);
        Ok(RunningNode {
            config,
            agent,
            store: replicated,
            rpc_addr,
            http_addr,
            shutdown_tx,
            tasks,
        })
    }
}

/// A started node. Dropping it does not stop the background tasks; call
/// [`RunningNode::shutdown`].
pub struct RunningNode {
    config: NodeConfig,
    agent: Arc<MembershipAgent>,
    store: Arc<ReplicatedStore>,
    rpc_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningNode {
    pub fn id(&self) -> &str {
        &self.config.node_id
    }

    pub fn agent(&self) -> &Arc<MembershipAgent> {
        &self.agent
    }

    pub fn store(&self) -> &Arc<ReplicatedStore> {
        &self.store
    }

    /// Advertised store RPC address.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    /// Advertised gossip address.
    pub fn gossip_address(&self) -> String {
        self.agent.local_node().address
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Leave the cluster, stop every task and flush the store. Teardown
    /// completes even if the leave fails; that error is returned.
    pub async fn shutdown(self) -> Result<()> {
        let leave = self.agent.shutdown().await;
        let _ = self.shutdown_tx.send(true);

        for task in self.tasks {
            let abort = task.abort_handle();
            if time::timeout(self.config.leave_timeout(), task).await.is_err() {
                abort.abort();
            }
        }
        if let Err(e) = self.store.store().flush() {
            warn!("store flush on shutdown failed: {}", e);
        }
        info!("Node {} stopped", self.config.node_id);
        leave
    }
}

/// Resolve the initial contact set and join it.
async fn bootstrap(config: &NodeConfig, store: &Store, agent: &MembershipAgent) -> Result<()> {
    let cached = store.cached_peer_addresses()?;
    let initial = PeerBootstrap::with_timeout(config.probe_timeout())
        .resolve_initial_peers(&config.seeds, &cached)
        .await?;

    match agent.join(&initial).await {
        Ok(joined) => {
            info!(joined, candidates = initial.len(), "bootstrap complete");
            Ok(())
        }
        // Rejoining from cache alone is best effort.
        Err(e) if config.seeds.is_empty() => {
            warn!("could not rejoin cached peers, continuing standalone: {}", e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Persist known peers' gossip addresses. Only new or moved peers are
/// written; the update signal fires on every gossip merge.
async fn peer_cache_loop(
    agent: Arc<MembershipAgent>,
    store: Arc<Store>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut updates = agent.subscribe_updates();
    let mut written: HashMap<String, String> = HashMap::new();
    loop {
        for peer in agent.directory().snapshot() {
            if written.get(&peer.id) == Some(&peer.address) {
                continue;
            }
            match store.cache_peer(&peer.id, &peer.address) {
                Ok(_) => {
                    written.insert(peer.id, peer.address);
                }
                Err(e) => warn!(peer = %peer.id, "failed to cache peer: {}", e),
            }
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

async fn event_log_loop(
    mut events: mpsc::Receiver<MembershipEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(MembershipEvent::Joined(node)) => {
                    info!(peer = %node.id, address = %node.address, "member joined")
                }
                Some(MembershipEvent::Left(node)) => info!(peer = %node.id, "member left"),
                Some(MembershipEvent::Updated(node)) => {
                    tracing::debug!(peer = %node.id, "member updated")
                }
                None => break,
            }
        }
    }
}

