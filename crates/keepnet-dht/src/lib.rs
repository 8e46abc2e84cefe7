//! keepnet DHT - Kademlia DHT implementation for the keepnet storage network
//!
//! This crate provides the routing table, the replicated key/value store,
//! the provider registry, iterative lookups and bootstrap, and the
//! MetaInfo extension the storage roles use to exchange small keyed
//! messages with a named peer.

pub mod api;
pub mod bootstrap;
pub mod datastore;
pub mod dht;
mod handlers;
pub mod metainfo;
pub mod providers;
mod query;
pub mod record;
pub mod routing;
mod sender;

pub use api::{Routing, RoutingWithMetaInfo};
pub use datastore::{Datastore, DatastoreHandle, MemoryDatastore, SqliteDatastore};
pub use dht::{KadDht, RecordWithPeer, DEFAULT_GET_QUORUM};
pub use metainfo::{is_user_init_key, MetaMessageHandler, MetaRequest};
pub use providers::{Clock, ManualClock, ProviderManager, SystemClock};
pub use record::{LocalStore, PermissiveValidator, Validator};

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Not found")]
    NotFound,

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Failed to find any peer in routing table")]
    NoPeersInTable,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("All {failed} contacted peers failed, last error: {last}")]
    Aggregate { failed: usize, last: Box<DhtError> },

    #[error("Quorum not reached: {acked} of {needed} peers acknowledged")]
    QuorumNotReached { acked: usize, needed: usize },

    #[error("Datastore error: {0}")]
    Datastore(#[from] datastore::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] keepnet_core::Error),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Can't replace a newer value with an older value")]
    StaleRecord,

    #[error("Meta handler already assigned")]
    HandlerAlreadyAssigned,

    #[error("No meta handler assigned")]
    NoMetaHandler,

    #[error("Meta handler failed: {0}")]
    Handler(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("DHT is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DhtError>;

/// DHT node configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Number of nodes per k-bucket, and the replication factor
    pub k: usize,
    /// Parallelism factor for lookups
    pub alpha: usize,
    /// Protocol ids spoken, in preference order
    pub protocols: Vec<String>,
    /// Deadline for a single RPC round trip
    pub request_timeout: Duration,
    pub bootstrap: BootstrapConfig,
    pub providers: ProviderConfig,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            protocols: vec![keepnet_core::DEFAULT_PROTOCOL.to_string()],
            request_timeout: Duration::from_secs(10),
            bootstrap: BootstrapConfig::default(),
            providers: ProviderConfig::default(),
        }
    }
}

impl DhtConfig {
    /// Reject settings the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::InvalidConfig("k must be positive".to_string()));
        }
        if self.alpha == 0 {
            return Err(DhtError::InvalidConfig("alpha must be positive".to_string()));
        }
        if self.protocols.is_empty() {
            return Err(DhtError::InvalidConfig("at least one protocol is required".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(DhtError::InvalidConfig("request timeout must be positive".to_string()));
        }
        if self.bootstrap.timeout.is_zero() {
            return Err(DhtError::InvalidConfig("bootstrap timeout must be positive".to_string()));
        }
        if self.providers.provide_validity.is_zero() {
            return Err(DhtError::InvalidConfig("provide validity must be positive".to_string()));
        }
        if self.providers.cleanup_interval.is_zero() {
            return Err(DhtError::InvalidConfig("provider cleanup interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// Periodic routing table refresh
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Random-id lookups per round
    pub queries: usize,
    /// Time between rounds
    pub period: Duration,
    /// Deadline for each lookup in a round
    pub timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            queries: 1,
            period: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// How long a provider announcement stays valid
    pub provide_validity: Duration,
    /// Time between garbage collection sweeps
    pub cleanup_interval: Duration,
    /// Provider sets kept in the LRU cache
    pub cache_size: usize,
    /// Pending writes buffered before the datastore is flushed
    pub batch_size: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provide_validity: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            cache_size: 256,
            batch_size: 256,
        }
    }
}

/// Per-call options for value operations
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingOptions {
    /// Acknowledgements required by a put, or values collected by a get
    pub quorum: Option<usize>,
    /// Only touch the local datastore
    pub offline: bool,
}

impl RoutingOptions {
    pub fn quorum(n: usize) -> Self {
        Self {
            quorum: Some(n),
            ..Default::default()
        }
    }

    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DhtConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut cfg = DhtConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(DhtError::InvalidConfig(_))));

        cfg.request_timeout = Duration::from_secs(1);
        cfg.bootstrap.timeout = Duration::ZERO;
        assert!(matches!(cfg.validate(), Err(DhtError::InvalidConfig(_))));
    }
}
