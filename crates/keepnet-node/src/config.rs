//! Node configuration

use crate::roles::Role;
use anyhow::Context;
use keepnet_core::{PeerId, PeerInfo};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Address the TCP host listens on
    pub listen: String,

    /// Storage role this node plays
    pub role: Role,

    /// Peers dialed at startup, as `<hex peer id>@<host:port>`
    pub bootstrap_peers: Vec<String>,

    /// Keys this node announces itself as a provider of while running
    pub provide: Vec<String>,

    /// DHT configuration
    pub dht: DhtSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSettings {
    /// K parameter (nodes per bucket)
    pub k: usize,
    /// Alpha parameter (lookup parallelism)
    pub alpha: usize,
    /// Protocol id spoken with other peers
    pub protocol: String,
    /// RPC timeout in seconds
    pub request_timeout_secs: u64,
    /// Random lookups per bootstrap round
    pub bootstrap_queries: usize,
    /// Seconds between bootstrap rounds
    pub bootstrap_period_secs: u64,
    /// Timeout for each bootstrap lookup in seconds
    pub bootstrap_timeout_secs: u64,
    /// How long provider records stay valid, in seconds
    pub provide_validity_secs: u64,
    /// Seconds between provider garbage collection rounds
    pub cleanup_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.keepnet".to_string(),
            listen: "127.0.0.1:4001".to_string(),
            role: Role::User,
            bootstrap_peers: vec![],
            provide: vec![],
            dht: DhtSettings::default(),
        }
    }
}

impl Default for DhtSettings {
    fn default() -> Self {
        let dht = keepnet_dht::DhtConfig::default();
        Self {
            k: dht.k,
            alpha: dht.alpha,
            protocol: keepnet_core::DEFAULT_PROTOCOL.to_string(),
            request_timeout_secs: dht.request_timeout.as_secs(),
            bootstrap_queries: dht.bootstrap.queries,
            bootstrap_period_secs: dht.bootstrap.period.as_secs(),
            bootstrap_timeout_secs: dht.bootstrap.timeout.as_secs(),
            provide_validity_secs: dht.providers.provide_validity.as_secs(),
            cleanup_interval_secs: dht.providers.cleanup_interval.as_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Write configuration to a file, creating parent directories
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    /// DHT settings in the form the DHT crate takes
    pub fn dht_config(&self) -> keepnet_dht::DhtConfig {
        let mut cfg = keepnet_dht::DhtConfig {
            k: self.dht.k,
            alpha: self.dht.alpha,
            protocols: vec![self.dht.protocol.clone()],
            request_timeout: Duration::from_secs(self.dht.request_timeout_secs),
            ..Default::default()
        };
        cfg.bootstrap.queries = self.dht.bootstrap_queries;
        cfg.bootstrap.period = Duration::from_secs(self.dht.bootstrap_period_secs);
        cfg.bootstrap.timeout = Duration::from_secs(self.dht.bootstrap_timeout_secs);
        cfg.providers.provide_validity = Duration::from_secs(self.dht.provide_validity_secs);
        cfg.providers.cleanup_interval = Duration::from_secs(self.dht.cleanup_interval_secs);
        cfg
    }

    pub fn bootstrap_peer_infos(&self) -> anyhow::Result<Vec<PeerInfo>> {
        self.bootstrap_peers.iter().map(|s| parse_peer_addr(s)).collect()
    }
}

/// Parse `<hex peer id>@<host:port>`
pub fn parse_peer_addr(s: &str) -> anyhow::Result<PeerInfo> {
    let (id, addr) = s
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("expected <peer id>@<address>, got {}", s))?;
    if addr.is_empty() {
        anyhow::bail!("missing address in {}", s);
    }
    let id: PeerId = id.parse().with_context(|| format!("bad peer id in {}", s))?;
    Ok(PeerInfo::new(id, vec![addr.to_string()]))
}

pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.role = Role::Keeper;
        config.dht.k = 8;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.role, Role::Keeper);
        assert_eq!(loaded.dht.k, 8);
        assert_eq!(loaded.dht_config().k, 8);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "role = \"provider\"\n[dht]\nalpha = 5\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.role, Role::Provider);
        assert_eq!(loaded.dht.alpha, 5);
        assert_eq!(loaded.dht.k, 20);
        assert_eq!(loaded.listen, "127.0.0.1:4001");
    }

    #[test]
    fn test_parse_peer_addr() {
        let id = PeerId::random();
        let info = parse_peer_addr(&format!("{}@127.0.0.1:4001", id)).unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.addrs, vec!["127.0.0.1:4001".to_string()]);

        assert!(parse_peer_addr("127.0.0.1:4001").is_err());
        assert!(parse_peer_addr("zz@127.0.0.1:4001").is_err());
        assert!(parse_peer_addr(&format!("{}@", id)).is_err());
    }

    #[test]
    fn test_zero_timeout_from_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[dht]\nrequest_timeout_secs = 0\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.dht_config().validate().is_err());
    }

    #[test]
    fn test_dht_config_defaults_match() {
        let cfg = Config::default().dht_config();
        let reference = keepnet_dht::DhtConfig::default();
        assert_eq!(cfg.k, reference.k);
        assert_eq!(cfg.protocols, reference.protocols);
        assert_eq!(cfg.bootstrap.period, reference.bootstrap.period);
        assert_eq!(cfg.providers.provide_validity, reference.providers.provide_validity);
    }
}
