//! Membership agent: owns the gossip transport and the loops that keep the
//! peer directory current.

use crate::common::{timestamp_now_millis, Error, NodeConfig, Result, METRICS};
use crate::membership::delegate::{GossipDelegate, GossipState, MembershipEvent, MembershipState};
use crate::membership::directory::{Peer, PeerDirectory};
use crate::membership::transport::{GossipTransport, NodeInfo, TransportConfig};
use crate::store::PeerSource;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Settings for the membership agent, derived from [`NodeConfig`].
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub node_id: String,
    pub bind_addr: SocketAddr,
    pub advertise_addr: Option<SocketAddr>,
    /// Store RPC endpoint advertised to peers.
    pub rpc_address: String,
    pub heartbeat_interval: Duration,
    pub gossip_interval: Duration,
    pub reconcile_timeout: Duration,
    pub fanout: usize,
    pub meta_limit: usize,
    pub io_timeout: Duration,
    pub leave_timeout: Duration,
}

impl MembershipConfig {
    pub fn from_node_config(config: &NodeConfig, rpc_address: impl Into<String>) -> Self {
        Self {
            node_id: config.node_id.clone(),
            bind_addr: config.gossip_addr,
            advertise_addr: config.advertise_addr,
            rpc_address: rpc_address.into(),
            heartbeat_interval: config.heartbeat_interval(),
            gossip_interval: config.gossip_interval(),
            reconcile_timeout: config.reconcile_timeout(),
            fanout: config.gossip_fanout,
            meta_limit: config.meta_limit,
            io_timeout: config.rpc_timeout(),
            leave_timeout: config.leave_timeout(),
        }
    }
}

/// Address peers should use to reach a listener bound at `bound`.
///
/// An explicit advertise address wins. A wildcard bind advertises loopback.
pub fn advertise_address(bound: SocketAddr, configured: Option<SocketAddr>) -> SocketAddr {
    if let Some(addr) = configured {
        return addr;
    }
    if bound.ip().is_unspecified() {
        warn!(%bound, "bound to a wildcard address without an advertise address, advertising loopback");
        return SocketAddr::from((Ipv4Addr::LOCALHOST, bound.port()));
    }
    bound
}

pub struct MembershipAgent {
    state: Arc<MembershipState>,
    transport: Arc<GossipTransport>,
    config: MembershipConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MembershipAgent {
    /// Bind the gossip listener and spawn the membership loops.
    pub async fn start(config: MembershipConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let bound = listener.local_addr()?;
        let advertised = advertise_address(bound, config.advertise_addr).to_string();

        let local = Peer::new(
            config.node_id.clone(),
            advertised.clone(),
            config.rpc_address.clone(),
        );
        let state = Arc::new(MembershipState::new(local));
        let transport = Arc::new(GossipTransport::new(
            listener,
            NodeInfo::new(config.node_id.clone(), advertised.clone()),
            state.clone(),
            TransportConfig {
                io_timeout: config.io_timeout,
                fanout: config.fanout,
                dead_timeout: config.reconcile_timeout,
            },
        ));
        transport.set_local_meta(state.node_meta(config.meta_limit));

        let (shutdown_tx, _) = watch::channel(false);
        let agent = Arc::new(Self {
            state,
            transport,
            config,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(accept_loop(agent.transport.clone(), agent.shutdown_tx.subscribe())),
            tokio::spawn(gossip_loop(agent.clone())),
            tokio::spawn(reconcile_loop(agent.clone())),
            tokio::spawn(meta_refresh_loop(agent.clone())),
        ];
        *agent.tasks.lock().unwrap_or_else(|e| e.into_inner()) = tasks;

        info!(
            node = %agent.config.node_id,
            gossip = %advertised,
            rpc = %agent.config.rpc_address,
            "membership agent started"
        );
        Ok(agent)
    }

    /// Join the overlay through `addresses`. Returns the number of peers
    /// contacted successfully. Does not retry.
    pub async fn join(&self, addresses: &[String]) -> Result<usize> {
        let local_id = self.config.node_id.as_str();
        let mut attempted = 0;
        let mut joined = 0;
        let mut first_error = None;

        for addr in addresses {
            match self.transport.push_pull(addr, true).await {
                Ok(node) if node.id == local_id => {
                    debug!(addr = %addr, "join address is this node, skipping");
                }
                Ok(node) => {
                    attempted += 1;
                    joined += 1;
                    debug!(peer = %node.id, addr = %addr, "joined peer");
                }
                Err(e) => {
                    attempted += 1;
                    warn!(addr = %addr, "failed to join peer: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if attempted > 0 && joined == 0 {
            return Err(first_error.unwrap_or(Error::NoAvailablePeers));
        }
        info!(joined, "joined gossip overlay");
        Ok(joined)
    }

    /// Peers as advertised in this node's gossip metadata.
    pub fn peers(&self) -> Result<Vec<Peer>> {
        let meta = self.transport.local_meta();
        let state = GossipState::decode(&meta)
            .map_err(|e| Error::Decode(format!("local node meta: {}", e)))?;
        Ok(state.peers)
    }

    /// This node as known to the gossip transport.
    pub fn local_node(&self) -> Peer {
        let mut peer = self.state.local_peer();
        peer.last_seen = timestamp_now_millis();
        peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn directory(&self) -> &PeerDirectory {
        self.state.directory()
    }

    pub fn subscribe_updates(&self) -> watch::Receiver<u64> {
        self.state.subscribe()
    }

    pub fn take_events(&self) -> Option<mpsc::Receiver<MembershipEvent>> {
        self.state.take_events()
    }

    /// Evict peers not seen within the reconcile timeout and reap silent
    /// transport members. Returns the evicted peers.
    pub fn reconcile(&self) -> Vec<Peer> {
        let evicted = self
            .state
            .directory()
            .evict_stale(timestamp_now_millis(), self.config.reconcile_timeout);
        for peer in &evicted {
            METRICS.peers_evicted.inc();
            info!(peer = %peer.id, address = %peer.address, "evicted stale peer");
        }

        let reaped = self.transport.reap_dead(Instant::now());
        for node in &reaped {
            debug!(peer = %node.id, "reaped silent gossip member");
        }

        if !evicted.is_empty() {
            self.state.signal_update();
        }
        evicted
    }

    /// Leave the overlay within the leave timeout, then stop every task.
    /// Teardown happens even if the leave fails.
    pub async fn shutdown(&self) -> Result<()> {
        let result = match time::timeout(self.config.leave_timeout, self.transport.leave()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("gossip leave".into())),
        };
        if let Err(e) = &result {
            warn!("leaving gossip overlay failed: {}", e);
        }

        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        info!(node = %self.config.node_id, "membership agent stopped");
        result
    }
}

impl PeerSource for MembershipAgent {
    fn current_peers(&self) -> Vec<Peer> {
        self.state.directory().snapshot()
    }
}

async fn accept_loop(transport: Arc<GossipTransport>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = transport.accept() => match accepted {
                Ok((stream, remote)) => {
                    let transport = transport.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.handle_conn(stream).await {
                            debug!(%remote, "gossip connection failed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("gossip accept failed: {}", e);
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn gossip_loop(agent: Arc<MembershipAgent>) {
    let mut shutdown = agent.shutdown_tx.subscribe();
    let mut ticker = time::interval(agent.config.gossip_interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => agent.transport.gossip_round().await,
        }
    }
}

async fn reconcile_loop(agent: Arc<MembershipAgent>) {
    let mut shutdown = agent.shutdown_tx.subscribe();
    let mut ticker = time::interval(agent.config.heartbeat_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                agent.reconcile();
            }
        }
    }
}

/// Re-advertise local metadata whenever the peer set changes.
async fn meta_refresh_loop(agent: Arc<MembershipAgent>) {
    let mut shutdown = agent.shutdown_tx.subscribe();
    let mut updates = agent.state.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                agent
                    .transport
                    .set_local_meta(agent.state.node_meta(agent.config.meta_limit));
            }
        }
    }
}
