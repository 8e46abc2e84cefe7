//! Periodic routing table refresh
//!
//! Each round looks up a few random ids, then our own id, so the routing
//! table keeps learning about peers across the key space.

use crate::dht::{lock, KadDht};
use crate::{DhtError, Result};
use keepnet_core::PeerId;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info};

impl KadDht {
    /// Start the background refresh loop.
    ///
    /// Fails immediately when the configuration asks for no queries. Calling
    /// it again while the loop runs is a no-op.
    pub fn bootstrap(&self) -> Result<()> {
        self.ensure_open()?;
        let cfg = &self.inner.config.bootstrap;
        if cfg.queries == 0 {
            return Err(DhtError::InvalidConfig("bootstrap queries must be positive".to_string()));
        }
        if self.inner.bootstrapping.swap(true, Ordering::SeqCst) {
            debug!("Bootstrap already running");
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let period = cfg.period;
        let handle = tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let dht = KadDht { inner };
                if dht.is_closed() {
                    break;
                }
                if let Err(e) = dht.bootstrap_once().await {
                    debug!("Bootstrap round failed: {}", e);
                }
            }
        });

        lock(&self.inner.tasks).push(handle);
        info!("Bootstrap started, every {:?}", period);
        Ok(())
    }

    /// Run one refresh round now
    pub async fn bootstrap_once(&self) -> Result<()> {
        self.ensure_open()?;
        let cfg = self.inner.config.bootstrap.clone();
        if cfg.queries == 0 {
            return Err(DhtError::InvalidConfig("bootstrap queries must be positive".to_string()));
        }

        for _ in 0..cfg.queries {
            let id = PeerId::random();
            match timeout(cfg.timeout, self.find_peer(&id)).await {
                Ok(Ok(_)) | Ok(Err(DhtError::NotFound)) | Err(_) => {}
                Ok(Err(e)) => return Err(e),
            }
        }

        let self_id = self.inner.self_id;
        match timeout(cfg.timeout, self.get_closest_peers(self_id.as_bytes())).await {
            Ok(Ok(_)) | Ok(Err(DhtError::NotFound)) | Err(_) => {}
            Ok(Err(e)) => return Err(e),
        }

        debug!("Bootstrap round done, {} peers in table", self.routing_table_size());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DhtConfig, MemoryDatastore};
    use keepnet_core::transport::memory::MemoryNetwork;

    #[tokio::test]
    async fn test_bootstrap_starts_one_loop() {
        let net = MemoryNetwork::new();
        let host = net.add_host(PeerId::random());
        let dht = KadDht::new(host, Arc::new(MemoryDatastore::new()), DhtConfig::default()).unwrap();

        dht.bootstrap().unwrap();
        dht.bootstrap().unwrap();
        assert_eq!(lock(&dht.inner.tasks).len(), 1);

        dht.close().await;
        assert!(dht.bootstrap().is_err());
    }
}
