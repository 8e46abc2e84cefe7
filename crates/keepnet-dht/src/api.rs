//! Routing capabilities consumed by the storage roles
//!
//! Code outside the DHT depends on these traits rather than on
//! [`KadDht`], so a role can be driven by any implementation.

use crate::dht::{KadDht, RecordWithPeer};
use crate::metainfo::MetaMessageHandler;
use crate::{Result, RoutingOptions};
use async_trait::async_trait;
use keepnet_core::{PeerId, PeerInfo};
use std::sync::Arc;
use tokio::sync::mpsc;

#[async_trait]
pub trait Routing: Send + Sync {
    async fn put_value(&self, key: &str, value: Vec<u8>, opts: RoutingOptions) -> Result<()>;

    async fn get_value(&self, key: &str, opts: RoutingOptions) -> Result<Vec<u8>>;

    async fn get_values(&self, key: &str, n: usize) -> Result<Vec<RecordWithPeer>>;

    async fn search_value(&self, key: &str, opts: RoutingOptions) -> Result<mpsc::Receiver<Vec<u8>>>;

    async fn find_peer(&self, id: &PeerId) -> Result<PeerInfo>;

    async fn provide(&self, cid: &[u8], announce: bool) -> Result<()>;

    fn find_providers_async(&self, cid: &[u8], count: usize) -> mpsc::Receiver<PeerInfo>;

    async fn ping(&self, peer: &PeerId) -> Result<()>;

    fn bootstrap(&self) -> Result<()>;
}

/// Routing plus direct keyed messaging between named peers
#[async_trait]
pub trait RoutingWithMetaInfo: Routing {
    fn assign_meta_handler(&self, handler: Arc<dyn MetaMessageHandler>) -> Result<()>;

    async fn send_meta_request(&self, key: &str, value: Vec<u8>, peer: &PeerId, caller: &str) -> Result<String>;

    async fn send_meta_message(&self, key: &str, value: Vec<u8>, peer: &PeerId, caller: &str) -> Result<()>;
}

#[async_trait]
impl Routing for KadDht {
    async fn put_value(&self, key: &str, value: Vec<u8>, opts: RoutingOptions) -> Result<()> {
        KadDht::put_value(self, key, value, opts).await
    }

    async fn get_value(&self, key: &str, opts: RoutingOptions) -> Result<Vec<u8>> {
        KadDht::get_value(self, key, opts).await
    }

    async fn get_values(&self, key: &str, n: usize) -> Result<Vec<RecordWithPeer>> {
        KadDht::get_values(self, key, n).await
    }

    async fn search_value(&self, key: &str, opts: RoutingOptions) -> Result<mpsc::Receiver<Vec<u8>>> {
        KadDht::search_value(self, key, opts).await
    }

    async fn find_peer(&self, id: &PeerId) -> Result<PeerInfo> {
        KadDht::find_peer(self, id).await
    }

    async fn provide(&self, cid: &[u8], announce: bool) -> Result<()> {
        KadDht::provide(self, cid, announce).await
    }

    fn find_providers_async(&self, cid: &[u8], count: usize) -> mpsc::Receiver<PeerInfo> {
        KadDht::find_providers_async(self, cid, count)
    }

    async fn ping(&self, peer: &PeerId) -> Result<()> {
        KadDht::ping(self, peer).await
    }

    fn bootstrap(&self) -> Result<()> {
        KadDht::bootstrap(self)
    }
}

#[async_trait]
impl RoutingWithMetaInfo for KadDht {
    fn assign_meta_handler(&self, handler: Arc<dyn MetaMessageHandler>) -> Result<()> {
        KadDht::assign_meta_handler(self, handler)
    }

    async fn send_meta_request(&self, key: &str, value: Vec<u8>, peer: &PeerId, caller: &str) -> Result<String> {
        KadDht::send_meta_request(self, key, value, peer, caller).await
    }

    async fn send_meta_message(&self, key: &str, value: Vec<u8>, peer: &PeerId, caller: &str) -> Result<()> {
        KadDht::send_meta_message(self, key, value, peer, caller).await
    }
}
