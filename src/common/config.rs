//! Configuration for fleetkv nodes

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ID (unique identifier, random if not configured)
    #[serde(default)]
    pub node_id: String,

    /// Bind address for gossip traffic
    #[serde(default = "default_gossip_addr")]
    pub gossip_addr: SocketAddr,

    /// Gossip address advertised to peers (defaults to the bound address)
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Bind address for the store/membership gRPC API
    #[serde(default = "default_rpc_addr")]
    pub rpc_addr: SocketAddr,

    /// RPC address advertised to peers (defaults to the bound address)
    #[serde(default)]
    pub advertise_rpc_addr: Option<SocketAddr>,

    /// Bind address for the admin HTTP API (disabled if unset)
    #[serde(default)]
    pub http_addr: Option<SocketAddr>,

    /// Data directory holding the store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Seed gossip addresses (host:port)
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Membership heartbeat / reconciliation interval
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Gossip push-pull round interval
    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    /// Members contacted per gossip round
    #[serde(default = "default_gossip_fanout")]
    pub gossip_fanout: usize,

    /// Upper bound for the serialized node metadata
    #[serde(default = "default_meta_limit")]
    pub meta_limit: usize,

    /// Liveness probe deadline during bootstrap
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Deadline for peer-directed RPCs (replication, sync)
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,

    /// Tombstone sweep interval
    #[serde(default = "default_prune_interval")]
    pub prune_interval_ms: u64,

    /// Tombstone retention window
    #[serde(default = "default_tombstone_ttl")]
    pub tombstone_ttl_ms: u64,

    /// Periodic peer sync interval (0 disables)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,

    /// How long to wait for the store file lock
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: u64,

    /// Bound on the graceful leave during shutdown
    #[serde(default = "default_leave_timeout")]
    pub leave_timeout_ms: u64,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}
fn default_rpc_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7947))
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./fleetkv-data")
}
fn default_heartbeat_interval() -> u64 {
    10_000
}
fn default_gossip_interval() -> u64 {
    1_000
}
fn default_gossip_fanout() -> usize {
    3
}
fn default_meta_limit() -> usize {
    16 * 1024
}
fn default_probe_timeout() -> u64 {
    500
}
fn default_rpc_timeout() -> u64 {
    5_000
}
fn default_prune_interval() -> u64 {
    30_000
}
fn default_tombstone_ttl() -> u64 {
    90_000
}
fn default_sync_interval() -> u64 {
    60_000
}
fn default_open_timeout() -> u64 {
    1_000
}
fn default_leave_timeout() -> u64 {
    1_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            gossip_addr: default_gossip_addr(),
            advertise_addr: None,
            rpc_addr: default_rpc_addr(),
            advertise_rpc_addr: None,
            http_addr: None,
            data_dir: default_data_dir(),
            seeds: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            gossip_interval_ms: default_gossip_interval(),
            gossip_fanout: default_gossip_fanout(),
            meta_limit: default_meta_limit(),
            probe_timeout_ms: default_probe_timeout(),
            rpc_timeout_ms: default_rpc_timeout(),
            prune_interval_ms: default_prune_interval(),
            tombstone_ttl_ms: default_tombstone_ttl(),
            sync_interval_ms: default_sync_interval(),
            open_timeout_ms: default_open_timeout(),
            leave_timeout_ms: default_leave_timeout(),
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// `FLEETKV_*` environment variables (e.g. `FLEETKV_SEEDS=a:7946,b:7946`).
    /// `node_id` stays empty unless configured; see
    /// [`ensure_node_id`](Self::ensure_node_id).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FLEETKV")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("seeds"),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Fill in a random node id when none was configured. Returns whether
    /// one was generated.
    pub fn ensure_node_id(&mut self) -> bool {
        if !self.node_id.is_empty() {
            return false;
        }
        self.node_id = default_node_id();
        warn!(
            node_id = %self.node_id,
            "node_id not configured; peers will see a new node after every restart"
        );
        true
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::InvalidConfig("node_id must not be empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.gossip_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "gossip_interval_ms must be positive".into(),
            ));
        }
        if self.gossip_fanout == 0 {
            return Err(Error::InvalidConfig("gossip_fanout must be positive".into()));
        }
        if self.meta_limit == 0 {
            return Err(Error::InvalidConfig("meta_limit must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Peers not seen for this long are evicted.
    pub fn reconcile_timeout(&self) -> Duration {
        self.heartbeat_interval() * 3
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_ms > 0).then(|| Duration::from_millis(self.sync_interval_ms))
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(30));
        assert_eq!(config.tombstone_ttl(), Duration::from_secs(90));
        assert!(config.validate().is_ok());
        assert!(!config.node_id.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "node_id = \"node-a\"").unwrap();
        writeln!(file, "gossip_addr = \"127.0.0.1:9000\"").unwrap();
        writeln!(file, "seeds = [\"10.0.0.1:9000\", \"10.0.0.2:9000\"]").unwrap();
        writeln!(file, "sync_interval_ms = 0").unwrap();
        drop(file);

        let config = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.gossip_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.seeds.len(), 2);
        assert!(config.sync_interval().is_none());
        assert_eq!(config.gossip_fanout, 3);
    }

    #[test]
    fn test_node_id_generated_only_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "gossip_addr = \"127.0.0.1:9000\"\n").unwrap();

        let mut config = NodeConfig::load(Some(&path)).unwrap();
        assert!(config.node_id.is_empty());
        assert!(config.validate().is_err());
        assert!(config.ensure_node_id());
        assert!(!config.node_id.is_empty());
        assert!(config.validate().is_ok());

        let generated = config.node_id.clone();
        assert!(!config.ensure_node_id());
        assert_eq!(config.node_id, generated);
    }

    #[test]
    fn test_validate_rejects_zero_heartbeat() {
        let config = NodeConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
