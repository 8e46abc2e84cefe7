//! Node assembly: identity, datastore, TCP host, and DHT

use crate::config::Config;
use crate::roles::RoleHandler;
use anyhow::Context;
use keepnet_core::{Host, PeerId, TcpHost};
use keepnet_dht::{DatastoreHandle, KadDht, MemoryDatastore, SqliteDatastore};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const IDENTITY_FILE: &str = "peer_id";
const DATASTORE_FILE: &str = "datastore.db";

/// A running node
pub struct Node {
    pub dht: KadDht,
    pub host: Arc<TcpHost>,
}

impl Node {
    pub fn peer_id(&self) -> PeerId {
        self.dht.self_id()
    }

    /// `<peer id>@<address>` string other nodes can bootstrap from
    pub fn dial_string(&self) -> String {
        format!("{}@{}", self.peer_id(), self.host.local_addr())
    }

    /// Announce this node as a provider of each key.
    ///
    /// Returns how many keys were announced to at least one peer.
    pub async fn announce(&self, keys: &[String]) -> usize {
        let mut announced = 0;
        for key in keys {
            match self.dht.provide(key.as_bytes(), true).await {
                Ok(()) => {
                    announced += 1;
                    info!("Announced as provider of {}", key);
                }
                Err(e) => warn!("Failed to announce {}: {}", key, e),
            }
        }
        announced
    }

    pub async fn shutdown(&self) {
        self.dht.close().await;
        self.host.shutdown();
    }
}

/// Read the node's peer id from the data directory, creating one on first use
pub fn load_or_create_identity(data_dir: &Path) -> anyhow::Result<PeerId> {
    let path = data_dir.join(IDENTITY_FILE);
    if path.exists() {
        let hex = std::fs::read_to_string(&path)?;
        let id: PeerId = hex
            .trim()
            .parse()
            .with_context(|| format!("invalid identity file {}", path.display()))?;
        return Ok(id);
    }

    std::fs::create_dir_all(data_dir)?;
    let id = PeerId::random();
    std::fs::write(&path, id.to_hex())?;
    info!("Created new identity {}", id.short());
    Ok(id)
}

/// Open the datastore, bind the host, start the DHT and dial bootstrap peers
pub async fn start_node(config: &Config) -> anyhow::Result<Node> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let id = load_or_create_identity(&data_dir)?;
    let ds = Arc::new(SqliteDatastore::open(&data_dir.join(DATASTORE_FILE))?);
    launch(config, id, ds, &config.listen).await
}

/// Start a short-lived node with a fresh identity and an in-memory store,
/// for one-shot commands run next to a long-running node
pub async fn start_client(config: &Config, listen: &str) -> anyhow::Result<Node> {
    launch(config, PeerId::random(), Arc::new(MemoryDatastore::new()), listen).await
}

async fn launch(config: &Config, id: PeerId, ds: DatastoreHandle, listen: &str) -> anyhow::Result<Node> {
    let host = TcpHost::bind(id, listen).await?;

    let dht = KadDht::new(host.clone(), ds, config.dht_config())?;
    dht.assign_meta_handler(Arc::new(RoleHandler::new(config.role)))?;
    info!("Node {} started as {} on {:?}", id.short(), config.role, host.listen_addrs());

    for peer in config.bootstrap_peer_infos()? {
        match dht.connect_peer(&peer).await {
            Ok(()) => info!("Connected to bootstrap peer {}", peer.id.short()),
            Err(e) => warn!("Failed to connect to bootstrap peer {}: {}", peer.id.short(), e),
        }
    }

    Ok(Node { dht, host })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_is_persisted() {
        let dir = TempDir::new().unwrap();
        let first = load_or_create_identity(dir.path()).unwrap();
        let second = load_or_create_identity(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_identity_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(IDENTITY_FILE), "not hex").unwrap();
        assert!(load_or_create_identity(dir.path()).is_err());
    }
}
