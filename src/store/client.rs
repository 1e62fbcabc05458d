//! gRPC clients for a node's store and membership services.

use crate::common::{Error, Result};
use crate::membership::Peer;
use crate::proto::kv_store_client::KvStoreClient;
use crate::proto::membership_client::MembershipClient;
use crate::proto::*;
use crate::store::engine::KeyValue as StoreKeyValue;
use crate::store::replicated::{PeerTransport, SyncStream};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

/// Normalize `host:port` to a URI tonic can dial.
pub fn endpoint_uri(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

fn endpoint(address: &str, timeout: Duration) -> Result<Endpoint> {
    let endpoint = Endpoint::from_shared(endpoint_uri(address))
        .map_err(|e| Error::InvalidArgument(format!("address {:?}: {}", address, e)))?;
    Ok(endpoint.connect_timeout(timeout).timeout(timeout))
}

/// Client for one node.
pub struct StoreClient {
    kv: KvStoreClient<Channel>,
    membership: MembershipClient<Channel>,
}

impl StoreClient {
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let channel = endpoint(address, timeout)?.connect().await?;
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            kv: KvStoreClient::new(channel.clone()),
            membership: MembershipClient::new(channel),
        }
    }

    pub async fn create_bucket(&mut self, bucket: &str) -> Result<()> {
        self.kv
            .create_bucket(CreateBucketRequest {
                bucket: bucket.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn set(&mut self, bucket: &str, key: &str, value: Vec<u8>, sync: bool) -> Result<()> {
        self.kv
            .set(SetRequest {
                bucket: bucket.to_string(),
                key: key.to_string(),
                value,
                sync,
            })
            .await?;
        Ok(())
    }

    pub async fn get(&mut self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let response = self
            .kv
            .get(GetRequest {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
            .await?;
        Ok(response.into_inner().value)
    }

    pub async fn delete(&mut self, bucket: &str, key: &str, sync: bool) -> Result<()> {
        self.kv
            .delete(DeleteRequest {
                bucket: bucket.to_string(),
                key: key.to_string(),
                sync,
            })
            .await?;
        Ok(())
    }

    pub async fn search(&mut self, bucket: &str, prefix: &str) -> Result<Vec<StoreKeyValue>> {
        let response = self
            .kv
            .search(SearchRequest {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            })
            .await?;
        Ok(response
            .into_inner()
            .entries
            .into_iter()
            .map(|kv| StoreKeyValue {
                bucket: kv.bucket,
                key: kv.key,
                value: kv.value,
            })
            .collect())
    }

    pub async fn sync(&mut self) -> Result<SyncStream> {
        let stream = self.kv.sync(Empty {}).await?.into_inner();
        Ok(stream.map(|entry| entry.map_err(Error::from)).boxed())
    }

    pub async fn backup(&mut self) -> Result<Vec<u8>> {
        Ok(self.kv.backup(Empty {}).await?.into_inner().snapshot)
    }

    pub async fn restore(&mut self, snapshot: Vec<u8>) -> Result<()> {
        self.kv.restore(RestoreRequest { snapshot }).await?;
        Ok(())
    }

    pub async fn peers(&mut self) -> Result<Vec<Peer>> {
        let response = self.membership.peers(Empty {}).await?;
        Ok(response.into_inner().peers.into_iter().map(Peer::from).collect())
    }

    pub async fn local_node(&mut self) -> Result<Peer> {
        Ok(self.membership.local_node(Empty {}).await?.into_inner().into())
    }
}

/// [`PeerTransport`] over tonic. Channels are created lazily and reused
/// per address.
pub struct GrpcPeerTransport {
    timeout: Duration,
    channels: Mutex<HashMap<String, Channel>>,
}

impl GrpcPeerTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, address: &str) -> Result<StoreClient> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = channels.get(address) {
            return Ok(StoreClient::from_channel(channel.clone()));
        }
        let channel = endpoint(address, self.timeout)?.connect_lazy();
        channels.insert(address.to_string(), channel.clone());
        Ok(StoreClient::from_channel(channel))
    }
}

#[tonic::async_trait]
impl PeerTransport for GrpcPeerTransport {
    async fn set(&self, address: &str, request: SetRequest) -> Result<()> {
        let mut client = self.client(address)?;
        client.kv.set(request).await?;
        Ok(())
    }

    async fn delete(&self, address: &str, request: DeleteRequest) -> Result<()> {
        let mut client = self.client(address)?;
        client.kv.delete(request).await?;
        Ok(())
    }

    async fn sync(&self, address: &str) -> Result<SyncStream> {
        self.client(address)?.sync().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uri() {
        assert_eq!(endpoint_uri("10.0.0.1:7947"), "http://10.0.0.1:7947");
        assert_eq!(endpoint_uri("http://node:7947"), "http://node:7947");
        assert_eq!(endpoint_uri("https://node:7947"), "https://node:7947");
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails() {
        let dead = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };
        let transport = GrpcPeerTransport::new(Duration::from_millis(500));
        let result = transport
            .set(
                &dead,
                SetRequest {
                    bucket: "b".into(),
                    key: "k".into(),
                    value: Vec::new(),
                    sync: false,
                },
            )
            .await;
        assert!(result.is_err());
    }
}
