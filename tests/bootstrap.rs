//! Bootstrap decisions: seeds, peer cache and liveness

use fleetkv::membership::{LivenessProbe, PeerBootstrap, TcpProbe};
use fleetkv::Error;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpListener;

/// Probe answering from a fixed set of live addresses, recording each call.
#[derive(Default)]
struct ScriptedProbe {
    alive: HashSet<String>,
    probed: Mutex<Vec<String>>,
}

impl ScriptedProbe {
    fn alive(addrs: &[&str]) -> Self {
        Self {
            alive: addrs.iter().map(|a| a.to_string()).collect(),
            probed: Mutex::new(Vec::new()),
        }
    }
}

#[tonic::async_trait]
impl LivenessProbe for ScriptedProbe {
    async fn is_alive(&self, addr: &str) -> bool {
        self.probed.lock().unwrap().push(addr.to_string());
        self.alive.contains(addr)
    }
}

fn owned(addrs: &[&str]) -> Vec<String> {
    addrs.iter().map(|a| a.to_string()).collect()
}

#[tokio::test]
async fn test_restart_without_seeds_uses_live_cache_entries() {
    let bootstrap = PeerBootstrap::new(ScriptedProbe::alive(&["10.0.0.2:7946", "10.0.0.4:7946"]));
    let cached = owned(&["10.0.0.2:7946", "10.0.0.3:7946", "10.0.0.4:7946"]);

    let peers = bootstrap.resolve_initial_peers(&[], &cached).await.unwrap();
    assert_eq!(peers, owned(&["10.0.0.2:7946", "10.0.0.4:7946"]));
}

#[tokio::test]
async fn test_cache_ignored_when_seeds_moved() {
    let probe = ScriptedProbe::alive(&["10.0.0.9:7946", "10.0.0.2:7946"]);
    let bootstrap = PeerBootstrap::new(probe);
    let seeds = owned(&["10.0.0.9:7946"]);
    let cached = owned(&["10.0.0.2:7946"]);

    let peers = bootstrap.resolve_initial_peers(&seeds, &cached).await.unwrap();
    assert_eq!(peers, seeds);
}

#[tokio::test]
async fn test_cache_preferred_when_it_covers_seeds() {
    let bootstrap = PeerBootstrap::new(ScriptedProbe::alive(&[
        "10.0.0.1:7946",
        "10.0.0.2:7946",
    ]));
    let seeds = owned(&["10.0.0.1:7946"]);
    let cached = owned(&["10.0.0.1:7946", "10.0.0.2:7946"]);

    let peers = bootstrap.resolve_initial_peers(&seeds, &cached).await.unwrap();
    assert_eq!(peers, cached);
}

#[tokio::test]
async fn test_all_seeds_down_is_an_error() {
    let bootstrap = PeerBootstrap::new(ScriptedProbe::default());
    let seeds = owned(&["10.0.0.1:7946", "10.0.0.2:7946"]);

    let result = bootstrap.resolve_initial_peers(&seeds, &[]).await;
    assert!(matches!(result, Err(Error::NoAvailablePeers)));
}

#[tokio::test]
async fn test_nothing_configured_starts_new_cluster() {
    let probe = ScriptedProbe::default();
    let bootstrap = PeerBootstrap::new(probe);
    assert!(bootstrap
        .resolve_initial_peers(&[], &[])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_tcp_probe_against_real_sockets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live = listener.local_addr().unwrap().to_string();
    let dead = {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        closed.local_addr().unwrap().to_string()
    };
    let _server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let bootstrap = PeerBootstrap::with_timeout(Duration::from_millis(300));
    let peers = bootstrap
        .resolve_initial_peers(&[], &[dead.clone(), live.clone()])
        .await
        .unwrap();
    assert_eq!(peers, vec![live]);

    assert!(!TcpProbe::new(Duration::from_millis(300)).is_alive(&dead).await);
}
