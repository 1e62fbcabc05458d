//! Gossip wire transport over TCP

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, trace, warn};

use crate::common::{Error, Result};
use crate::membership::delegate::GossipDelegate;

/// Upper bound on a single gossip frame.
const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Transport-level view of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    /// Gossip endpoint.
    pub address: String,
    /// Delegate-provided metadata.
    pub meta: Vec<u8>,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            meta: Vec::new(),
        }
    }
}

/// Member reference piggybacked on push-pull exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRef {
    pub id: String,
    pub address: String,
}

/// Messages exchanged over gossip connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// State exchange. The receiver merges it and answers with its own.
    PushPull {
        from: NodeInfo,
        state: Vec<u8>,
        join: bool,
        members: Vec<MemberRef>,
    },
    /// Graceful departure.
    Leave { from: NodeInfo },
}

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// Deadline for connecting and for each frame read/write.
    pub io_timeout: Duration,
    /// Members contacted per gossip round.
    pub fanout: usize,
    /// Members not heard from for this long are declared gone.
    pub dead_timeout: Duration,
}

struct Member {
    info: NodeInfo,
    last_heard: Instant,
}

/// TCP gossip transport: push-pull state exchange, member tracking and
/// graceful leave. The listener also answers bootstrap liveness probes.
///
/// Members that left or were reaped are remembered for `dead_timeout`.
/// Rumors about them are ignored in that window; only direct contact
/// brings them back.
pub struct GossipTransport {
    listener: TcpListener,
    local: RwLock<NodeInfo>,
    members: Mutex<HashMap<String, Member>>,
    departed: Mutex<HashMap<String, Instant>>,
    delegate: Arc<dyn GossipDelegate>,
    config: TransportConfig,
}

impl GossipTransport {
    /// Wrap an already bound listener.
    pub fn new(
        listener: TcpListener,
        local: NodeInfo,
        delegate: Arc<dyn GossipDelegate>,
        config: TransportConfig,
    ) -> Self {
        Self {
            listener,
            local: RwLock::new(local),
            members: Mutex::new(HashMap::new()),
            departed: Mutex::new(HashMap::new()),
            delegate,
            config,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn local_node(&self) -> NodeInfo {
        self.local.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn local_meta(&self) -> Vec<u8> {
        self.local
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .meta
            .clone()
    }

    /// Replace the metadata advertised for the local node.
    pub fn set_local_meta(&self, meta: Vec<u8>) {
        self.local.write().unwrap_or_else(|e| e.into_inner()).meta = meta;
    }

    pub fn members(&self) -> Vec<NodeInfo> {
        let members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        let mut nodes: Vec<NodeInfo> = members.values().map(|m| m.info.clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn num_members(&self) -> usize {
        self.members.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Accept the next inbound connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        Ok(self.listener.accept().await?)
    }

    /// Serve one inbound connection.
    pub async fn handle_conn(&self, mut stream: TcpStream) -> Result<()> {
        let message = match read_frame(&mut stream, self.config.io_timeout).await? {
            Some(message) => message,
            // Connected and closed without a frame: a liveness probe.
            None => return Ok(()),
        };

        match message {
            GossipMessage::PushPull {
                from,
                state,
                join,
                members,
            } => {
                trace!(peer = %from.id, join, "received push-pull");
                let reply = self.push_pull_message(false);
                self.absorb(from, &state, join, members);
                write_frame(&mut stream, &reply, self.config.io_timeout).await?;
            }
            GossipMessage::Leave { from } => {
                debug!(peer = %from.id, "received leave");
                self.forget(&from);
            }
        }
        Ok(())
    }

    /// Exchange state with the node at `addr`. Returns the remote node.
    pub async fn push_pull(&self, addr: &str, join: bool) -> Result<NodeInfo> {
        let mut stream = connect(addr, self.config.io_timeout).await?;
        let request = self.push_pull_message(join);
        write_frame(&mut stream, &request, self.config.io_timeout).await?;

        match read_frame(&mut stream, self.config.io_timeout).await? {
            Some(GossipMessage::PushPull {
                from,
                state,
                members,
                ..
            }) => {
                self.absorb(from.clone(), &state, join, members);
                Ok(from)
            }
            Some(GossipMessage::Leave { .. }) => Err(Error::Decode(format!(
                "unexpected leave reply from {}",
                addr
            ))),
            None => Err(Error::ConnectionFailed(format!(
                "{} closed the connection",
                addr
            ))),
        }
    }

    /// One gossip round: push-pull with up to `fanout` random members.
    pub async fn gossip_round(&self) {
        let targets: Vec<NodeInfo> = {
            let mut nodes = self.members();
            nodes.shuffle(&mut rand::thread_rng());
            nodes.truncate(self.config.fanout);
            nodes
        };
        if targets.is_empty() {
            return;
        }

        let results = join_all(
            targets
                .iter()
                .map(|node| self.push_pull(&node.address, false)),
        )
        .await;
        for (node, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                debug!(peer = %node.id, "gossip exchange failed: {}", e);
            }
        }
    }

    /// Declare members gone after `dead_timeout` without direct contact.
    pub fn reap_dead(&self, now: Instant) -> Vec<NodeInfo> {
        let dead: Vec<NodeInfo> = {
            let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = members
                .iter()
                .filter(|(_, m)| {
                    now.saturating_duration_since(m.last_heard) > self.config.dead_timeout
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| members.remove(id))
                .map(|m| m.info)
                .collect()
        };
        {
            let mut departed = self.departed.lock().unwrap_or_else(|e| e.into_inner());
            departed.retain(|_, at| now.saturating_duration_since(*at) <= self.config.dead_timeout);
            for node in &dead {
                departed.insert(node.id.clone(), now);
            }
        }
        for node in &dead {
            self.delegate.notify_leave(node);
        }
        dead
    }

    /// Tell every member we are leaving. Members that cannot be reached are
    /// skipped; this fails only when none of them could be told.
    pub async fn leave(&self) -> Result<()> {
        let message = GossipMessage::Leave {
            from: self.local_node(),
        };
        let members = self.members();
        let results = join_all(members.iter().map(|node| async {
            let mut stream = connect(&node.address, self.config.io_timeout).await?;
            write_frame(&mut stream, &message, self.config.io_timeout).await
        }))
        .await;

        let mut delivered = 0;
        let mut first_error = None;
        for (node, result) in members.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(peer = %node.id, "leave not delivered: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }

    fn recently_departed(&self, id: &str) -> bool {
        self.departed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .is_some_and(|at| Instant::now().saturating_duration_since(*at) <= self.config.dead_timeout)
    }

    fn push_pull_message(&self, join: bool) -> GossipMessage {
        let members = self
            .members()
            .into_iter()
            .map(|m| MemberRef {
                id: m.id,
                address: m.address,
            })
            .collect();
        GossipMessage::PushPull {
            from: self.local_node(),
            state: self.delegate.local_state(join),
            join,
            members,
        }
    }

    fn absorb(&self, from: NodeInfo, state: &[u8], join: bool, rumors: Vec<MemberRef>) {
        let local_id = self.local_node().id;
        if from.id != local_id {
            self.touch(from);
            self.delegate.merge_remote_state(state, join);
        }

        for rumor in rumors {
            if rumor.id == local_id || self.recently_departed(&rumor.id) {
                continue;
            }
            let joined = {
                let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
                if members.contains_key(&rumor.id) {
                    None
                } else {
                    let info = NodeInfo::new(rumor.id.clone(), rumor.address);
                    members.insert(
                        rumor.id,
                        Member {
                            info: info.clone(),
                            last_heard: Instant::now(),
                        },
                    );
                    Some(info)
                }
            };
            if let Some(node) = joined {
                self.delegate.notify_join(&node);
            }
        }
    }

    /// Record direct contact with a member.
    fn touch(&self, node: NodeInfo) {
        enum Change {
            Joined,
            Updated,
            Unchanged,
        }

        self.departed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node.id);

        let change = {
            let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
            match members.get_mut(&node.id) {
                Some(member) => {
                    member.last_heard = Instant::now();
                    if member.info != node {
                        member.info = node.clone();
                        Change::Updated
                    } else {
                        Change::Unchanged
                    }
                }
                None => {
                    members.insert(
                        node.id.clone(),
                        Member {
                            info: node.clone(),
                            last_heard: Instant::now(),
                        },
                    );
                    Change::Joined
                }
            }
        };

        match change {
            Change::Joined => self.delegate.notify_join(&node),
            Change::Updated => self.delegate.notify_update(&node),
            Change::Unchanged => {}
        }
    }

    fn forget(&self, node: &NodeInfo) {
        let removed = self
            .members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&node.id);
        self.departed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.id.clone(), Instant::now());
        if removed.is_some() {
            self.delegate.notify_leave(node);
        } else {
            warn!(peer = %node.id, "leave from unknown member");
        }
    }
}

async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::ConnectionFailed(format!("{}: {}", addr, e))),
        Err(_) => Err(Error::Timeout(format!("connect to {}", addr))),
    }
}

/// Write one length-prefixed bincode frame.
pub async fn write_frame(
    stream: &mut TcpStream,
    message: &GossipMessage,
    timeout: Duration,
) -> Result<()> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::InvalidArgument(format!(
            "gossip frame too large: {} bytes",
            payload.len()
        )));
    }
    let write = async {
        stream.write_u32(payload.len() as u32).await?;
        stream.write_all(&payload).await?;
        stream.flush().await
    };
    time::timeout(timeout, write)
        .await
        .map_err(|_| Error::Timeout("gossip frame write".into()))??;
    Ok(())
}

/// Read one frame. `None` if the peer closed before sending anything.
pub async fn read_frame(stream: &mut TcpStream, timeout: Duration) -> Result<Option<GossipMessage>> {
    let read = async {
        let len = match stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        if len > MAX_FRAME_SIZE {
            return Err(Error::Decode(format!("gossip frame too large: {} bytes", len)));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        Ok(Some(bincode::deserialize(&buf)?))
    };
    time::timeout(timeout, read)
        .await
        .map_err(|_| Error::Timeout("gossip frame read".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        merged: StdMutex<Vec<Vec<u8>>>,
        joined: StdMutex<Vec<String>>,
        left: StdMutex<Vec<String>>,
        updated: StdMutex<Vec<String>>,
    }

    impl GossipDelegate for Recorder {
        fn node_meta(&self, _limit: usize) -> Vec<u8> {
            Vec::new()
        }
        fn local_state(&self, _join: bool) -> Vec<u8> {
            b"state".to_vec()
        }
        fn merge_remote_state(&self, buf: &[u8], _join: bool) {
            self.merged.lock().unwrap().push(buf.to_vec());
        }
        fn notify_join(&self, node: &NodeInfo) {
            self.joined.lock().unwrap().push(node.id.clone());
        }
        fn notify_leave(&self, node: &NodeInfo) {
            self.left.lock().unwrap().push(node.id.clone());
        }
        fn notify_update(&self, node: &NodeInfo) {
            self.updated.lock().unwrap().push(node.id.clone());
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            io_timeout: Duration::from_secs(2),
            fanout: 3,
            dead_timeout: Duration::from_millis(100),
        }
    }

    async fn spawn_transport(id: &str) -> (Arc<GossipTransport>, Arc<Recorder>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let recorder = Arc::new(Recorder::default());
        let transport = Arc::new(GossipTransport::new(
            listener,
            NodeInfo::new(id, addr),
            recorder.clone(),
            config(),
        ));
        let server = transport.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = server.accept().await {
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = server.handle_conn(stream).await;
                });
            }
        });
        (transport, recorder)
    }

    #[tokio::test]
    async fn push_pull_registers_both_sides() {
        let (a, rec_a) = spawn_transport("a").await;
        let (b, rec_b) = spawn_transport("b").await;

        let remote = a
            .push_pull(&b.local_addr().unwrap().to_string(), true)
            .await
            .unwrap();
        assert_eq!(remote.id, "b");
        assert_eq!(a.num_members(), 1);
        assert_eq!(rec_a.joined.lock().unwrap().as_slice(), ["b"]);
        assert_eq!(rec_a.merged.lock().unwrap()[0], b"state");

        // b handled the request before replying
        assert_eq!(b.num_members(), 1);
        assert_eq!(rec_b.joined.lock().unwrap().as_slice(), ["a"]);
    }

    #[tokio::test]
    async fn members_propagate_through_rumors() {
        let (a, _) = spawn_transport("a").await;
        let (b, _) = spawn_transport("b").await;
        let (c, rec_c) = spawn_transport("c").await;

        let b_addr = b.local_addr().unwrap().to_string();
        a.push_pull(&b_addr, true).await.unwrap();
        c.push_pull(&b_addr, true).await.unwrap();

        let ids: Vec<String> = c.members().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(rec_c.joined.lock().unwrap().contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn meta_change_notifies_update() {
        let (a, _) = spawn_transport("a").await;
        let (b, rec_b) = spawn_transport("b").await;
        let b_addr = b.local_addr().unwrap().to_string();

        a.push_pull(&b_addr, true).await.unwrap();
        a.set_local_meta(b"v2".to_vec());
        a.push_pull(&b_addr, false).await.unwrap();

        assert_eq!(rec_b.updated.lock().unwrap().as_slice(), ["a"]);
    }

    #[tokio::test]
    async fn leave_and_reap() {
        let (a, _) = spawn_transport("a").await;
        let (b, rec_b) = spawn_transport("b").await;
        let (c, rec_c) = spawn_transport("c").await;

        a.push_pull(&b.local_addr().unwrap().to_string(), true)
            .await
            .unwrap();
        a.leave().await.unwrap();
        // leave is fire-and-forget on the wire; wait for b to process it
        for _ in 0..50 {
            if b.num_members() == 0 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(b.num_members(), 0);
        assert_eq!(rec_b.left.lock().unwrap().as_slice(), ["a"]);

        c.push_pull(&b.local_addr().unwrap().to_string(), true)
            .await
            .unwrap();
        let reaped = c.reap_dead(Instant::now() + Duration::from_secs(1));
        assert_eq!(reaped.len(), 1);
        assert_eq!(rec_c.left.lock().unwrap().as_slice(), ["b"]);
    }

    #[tokio::test]
    async fn reaped_member_is_not_revived_by_rumor() {
        let (a, rec_a) = spawn_transport("a").await;
        let (b, _) = spawn_transport("b").await;
        let (x, _) = spawn_transport("x").await;
        let b_addr = b.local_addr().unwrap().to_string();

        x.push_pull(&b_addr, true).await.unwrap();
        a.push_pull(&b_addr, true).await.unwrap();
        assert!(a.members().iter().any(|m| m.id == "x"));

        let reaped = a.reap_dead(Instant::now() + Duration::from_secs(1));
        assert_eq!(reaped.len(), 2);

        // b still lists x; direct contact with b must not bring x back
        a.push_pull(&b_addr, false).await.unwrap();
        let ids: Vec<String> = a.members().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);
        let joined_x = rec_a.joined.lock().unwrap().iter().filter(|id| *id == "x").count();
        assert_eq!(joined_x, 1);

        // but x talking to a directly does
        x.push_pull(&a.local_addr().unwrap().to_string(), false)
            .await
            .unwrap();
        assert!(a.members().iter().any(|m| m.id == "x"));
    }

    #[tokio::test]
    async fn left_member_is_not_revived_by_rumor() {
        let (a, _) = spawn_transport("a").await;
        let (b, _) = spawn_transport("b").await;
        let (c, rec_c) = spawn_transport("c").await;
        let a_addr = a.local_addr().unwrap().to_string();
        let c_addr = c.local_addr().unwrap().to_string();

        b.push_pull(&a_addr, true).await.unwrap();
        c.push_pull(&a_addr, true).await.unwrap();
        assert_eq!(c.num_members(), 2);

        // deliver c's copy of the leave only; a still lists b
        let mut stream = TcpStream::connect(&c_addr).await.unwrap();
        write_frame(
            &mut stream,
            &GossipMessage::Leave {
                from: b.local_node(),
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        for _ in 0..50 {
            if c.num_members() == 1 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(c.num_members(), 1);

        c.push_pull(&a_addr, false).await.unwrap();
        assert_eq!(c.num_members(), 1);
        assert_eq!(rec_c.joined.lock().unwrap().iter().filter(|id| *id == "b").count(), 1);
    }

    #[tokio::test]
    async fn leave_skips_unreachable_members() {
        let (a, _) = spawn_transport("a").await;
        let (b, rec_b) = spawn_transport("b").await;
        let a_addr = a.local_addr().unwrap().to_string();

        // a member whose listener is gone by the time a leaves
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gone_addr = listener.local_addr().unwrap().to_string();
        let gone = GossipTransport::new(
            listener,
            NodeInfo::new("gone", gone_addr),
            Arc::new(Recorder::default()),
            config(),
        );
        gone.push_pull(&a_addr, true).await.unwrap();
        drop(gone);

        a.push_pull(&b.local_addr().unwrap().to_string(), true)
            .await
            .unwrap();
        assert_eq!(a.num_members(), 2);

        a.leave().await.unwrap();
        for _ in 0..50 {
            if !rec_b.left.lock().unwrap().is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rec_b.left.lock().unwrap().as_slice(), ["a"]);
    }

    #[tokio::test]
    async fn leave_fails_when_no_member_is_reachable() {
        let (a, _) = spawn_transport("a").await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gone_addr = listener.local_addr().unwrap().to_string();
        let gone = GossipTransport::new(
            listener,
            NodeInfo::new("gone", gone_addr),
            Arc::new(Recorder::default()),
            config(),
        );
        gone.push_pull(&a.local_addr().unwrap().to_string(), true)
            .await
            .unwrap();
        drop(gone);

        assert!(a.leave().await.is_err());
    }

    #[tokio::test]
    async fn probe_connection_is_ignored() {
        let (a, rec_a) = spawn_transport("a").await;
        let stream = TcpStream::connect(a.local_addr().unwrap()).await.unwrap();
        drop(stream);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.num_members(), 0);
        assert!(rec_a.merged.lock().unwrap().is_empty());
    }
}
