//! Initial peer resolution for a starting or restarting node.
//!
//! Policy:
//! 1. No seeds and no cache: first node of a new cluster, nothing to contact.
//! 2. Seeds given: trust the cache only when its resolved addresses cover
//!    every resolved seed; otherwise use the seeds and ignore the cache.
//! 3. No seeds: use the cache.
//! 4. Probe the candidates in order and keep the reachable ones. With seeds
//!    configured, an empty result is `NoAvailablePeers`.

use crate::common::{Error, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};

/// Window after connecting during which an immediate close marks the peer dead.
const CLOSE_DETECT_WINDOW: Duration = Duration::from_millis(50);

/// Transport-level liveness check used during bootstrap.
#[tonic::async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self, addr: &str) -> bool;
}

/// Connects under a deadline and watches for an immediate peer close.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[tonic::async_trait]
impl LivenessProbe for TcpProbe {
    async fn is_alive(&self, addr: &str) -> bool {
        let mut stream = match time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(addr, "probe connect failed: {}", e);
                return false;
            }
            Err(_) => {
                debug!(addr, "probe connect timed out");
                return false;
            }
        };

        let mut buf = [0u8; 1];
        match time::timeout(CLOSE_DETECT_WINDOW, stream.read(&mut buf)).await {
            // Silence: the peer holds the connection open.
            Err(_) => true,
            Ok(Ok(0)) => {
                debug!(addr, "probe connection closed by peer");
                false
            }
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr, "probe read failed: {}", e);
                false
            }
        }
    }
}

pub struct PeerBootstrap<P = TcpProbe> {
    probe: P,
}

impl PeerBootstrap<TcpProbe> {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new(TcpProbe::new(timeout))
    }
}

impl<P: LivenessProbe> PeerBootstrap<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    /// Decide which addresses to contact from configured seeds and the
    /// persisted peer cache.
    pub async fn resolve_initial_peers(
        &self,
        seeds: &[String],
        cached: &[String],
    ) -> Result<Vec<String>> {
        if seeds.is_empty() && cached.is_empty() {
            info!("no seeds and no cached peers, starting a new cluster");
            return Ok(Vec::new());
        }

        let mut candidates = cached;
        if !seeds.is_empty() {
            if cache_covers_seeds(seeds, cached).await {
                debug!(cached = cached.len(), "peer cache covers all seeds");
            } else {
                info!(
                    seeds = seeds.len(),
                    cached = cached.len(),
                    "peer cache does not cover seeds, using seeds"
                );
                candidates = seeds;
            }
        }

        let mut reachable = Vec::with_capacity(candidates.len());
        for addr in candidates {
            if self.probe.is_alive(addr).await {
                reachable.push(addr.clone());
            } else {
                debug!(addr = %addr, "candidate peer unreachable");
            }
        }

        if !seeds.is_empty() && reachable.is_empty() {
            return Err(Error::NoAvailablePeers);
        }

        info!(
            candidates = candidates.len(),
            reachable = reachable.len(),
            "resolved initial peers"
        );
        Ok(reachable)
    }
}

/// Resolve `host:port` to its first address.
async fn resolve(addr: &str) -> Option<SocketAddr> {
    match tokio::net::lookup_host(addr).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            debug!(addr, "address resolution failed: {}", e);
            None
        }
    }
}

async fn cache_covers_seeds(seeds: &[String], cached: &[String]) -> bool {
    if cached.is_empty() {
        return false;
    }

    let mut cached_keys = HashSet::with_capacity(cached.len());
    for addr in cached {
        if let Some(key) = resolve(addr).await {
            cached_keys.insert(key);
        }
    }

    for seed in seeds {
        match resolve(seed).await {
            Some(key) if cached_keys.contains(&key) => {}
            _ => return false,
        }
    }
    true
}
