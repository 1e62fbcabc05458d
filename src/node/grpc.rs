//! gRPC services exposed by a node
//!
//! Handlers only call into the replicated store and the membership agent;
//! they never touch the peer directory directly.

use crate::membership::{MembershipAgent, Peer};
use crate::proto::kv_store_server::{KvStore, KvStoreServer};
use crate::proto::membership_server::{Membership, MembershipServer};
use crate::proto::*;
use crate::store::ReplicatedStore;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::debug;

impl From<Peer> for PeerInfo {
    fn from(peer: Peer) -> Self {
        PeerInfo {
            id: peer.id,
            address: peer.address,
            rpc_address: peer.rpc_address,
            last_seen: peer.last_seen,
        }
    }
}

impl From<PeerInfo> for Peer {
    fn from(info: PeerInfo) -> Self {
        Peer {
            id: info.id,
            address: info.address,
            rpc_address: info.rpc_address,
            last_seen: info.last_seen,
        }
    }
}

pub struct KvStoreService {
    store: Arc<ReplicatedStore>,
}

impl KvStoreService {
    pub fn new(store: Arc<ReplicatedStore>) -> Self {
        Self { store }
    }

    pub fn into_server(self) -> KvStoreServer<Self> {
        KvStoreServer::new(self)
    }
}

#[tonic::async_trait]
impl KvStore for KvStoreService {
    async fn create_bucket(
        &self,
        req: Request<CreateBucketRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = req.into_inner();
        self.store
            .create_bucket(&req.bucket)
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(Empty {}))
    }

    async fn set(&self, req: Request<SetRequest>) -> Result<Response<Empty>, Status> {
        let req = req.into_inner();
        debug!(bucket = %req.bucket, key = %req.key, sync = req.sync, "set");
        self.store
            .set(&req.bucket, &req.key, &req.value, req.sync)
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(Empty {}))
    }

    async fn get(&self, req: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let req = req.into_inner();
        let value = self
            .store
            .get(&req.bucket, &req.key)
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(GetResponse { value }))
    }

    async fn delete(&self, req: Request<DeleteRequest>) -> Result<Response<Empty>, Status> {
        let req = req.into_inner();
        debug!(bucket = %req.bucket, key = %req.key, sync = req.sync, "delete");
        self.store
            .delete(&req.bucket, &req.key, req.sync)
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(Empty {}))
    }

    async fn search(
        &self,
        req: Request<SearchRequest>,
    ) -> Result<Response<SearchResponse>, Status> {
        let req = req.into_inner();
        let entries = self
            .store
            .search(&req.bucket, &req.prefix)
            .map_err(|e| e.to_grpc_status())?
            .into_iter()
            .map(|kv| KeyValue {
                bucket: kv.bucket,
                key: kv.key,
                value: kv.value,
            })
            .collect();
        Ok(Response::new(SearchResponse { entries }))
    }

    type SyncStream = Pin<Box<dyn Stream<Item = Result<SyncEntry, Status>> + Send>>;

    async fn sync(&self, _req: Request<Empty>) -> Result<Response<Self::SyncStream>, Status> {
        let entries = self.store.dump().map_err(|e| e.to_grpc_status())?;
        debug!(entries = entries.len(), "serving sync stream");

        let stream = async_stream::stream! {
            for entry in entries {
                yield Ok::<_, Status>(SyncEntry::from(entry));
            }
        };
        Ok(Response::new(Box::pin(stream)))
    }

    async fn backup(&self, _req: Request<Empty>) -> Result<Response<BackupResponse>, Status> {
        let snapshot = self.store.backup().await.map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(BackupResponse { snapshot }))
    }

    async fn restore(&self, req: Request<RestoreRequest>) -> Result<Response<Empty>, Status> {
        self.store
            .restore(req.into_inner().snapshot)
            .await
            .map_err(|e| e.to_grpc_status())?;
        Ok(Response::new(Empty {}))
    }
}

pub struct MembershipService {
    agent: Arc<MembershipAgent>,
}

impl MembershipService {
    pub fn new(agent: Arc<MembershipAgent>) -> Self {
        Self { agent }
    }

    pub fn into_server(self) -> MembershipServer<Self> {
        MembershipServer::new(self)
    }
}

#[tonic::async_trait]
impl Membership for MembershipService {
    async fn peers(&self, _req: Request<Empty>) -> Result<Response<PeersResponse>, Status> {
        let peers = self
            .agent
            .peers()
            .map_err(|e| e.to_grpc_status())?
            .into_iter()
            .map(PeerInfo::from)
            .collect();
        Ok(Response::new(PeersResponse { peers }))
    }

    async fn local_node(&self, _req: Request<Empty>) -> Result<Response<PeerInfo>, Status> {
        Ok(Response::new(self.agent.local_node().into()))
    }
}
