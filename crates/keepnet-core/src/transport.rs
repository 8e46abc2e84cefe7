//! Transport abstraction for peer-to-peer streams
//!
//! The DHT reaches other peers through a [`Host`], which owns dialing, the
//! peerstore, connectedness tracking, and inbound stream dispatch. This
//! allows for:
//! - An in-memory network for tests and single-process simulations
//! - A TCP host for real deployments (see [`crate::tcp`])
//! - Future alternative transports

use crate::{Connectedness, PeerId, PeerInfo, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// How the remote side should treat a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// The sender waits for exactly one reply frame
    Request,
    /// Fire-and-forget; the receiver must not reply
    OneWay,
}

impl FrameKind {
    pub fn to_byte(self) -> u8 {
        match self {
            FrameKind::Request => 0,
            FrameKind::OneWay => 1,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(FrameKind::Request),
            1 => Some(FrameKind::OneWay),
            _ => None,
        }
    }
}

/// An open, protocol-negotiated stream to one remote peer
#[async_trait]
pub trait MessageStream: Send {
    /// Protocol negotiated for this stream
    fn protocol(&self) -> &str;

    /// Write a frame and wait for the peer's reply
    async fn request(&mut self, payload: Vec<u8>) -> Result<Vec<u8>>;

    /// Write a frame without waiting for a reply
    async fn send(&mut self, payload: Vec<u8>) -> Result<()>;
}

/// Receives inbound frames for the protocols it was registered under
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Handle one inbound frame.
    ///
    /// For [`FrameKind::Request`] frames the returned bytes are written back
    /// as the reply; returning `None` resets the stream.
    async fn handle_frame(&self, from: PeerId, payload: Vec<u8>, kind: FrameKind) -> Option<Vec<u8>>;
}

/// Network host: dialing, peerstore, and inbound dispatch
#[async_trait]
pub trait Host: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Addresses other peers can dial us on
    fn listen_addrs(&self) -> Vec<String>;

    /// Known addresses of a remote peer
    fn peer_addrs(&self, peer: &PeerId) -> Vec<String>;

    /// Remember addresses for a remote peer
    fn add_peer_addrs(&self, peer: &PeerId, addrs: &[String]);

    fn connectedness(&self, peer: &PeerId) -> Connectedness;

    /// Establish a connection to a peer, learning its addresses
    async fn connect(&self, peer: &PeerInfo) -> Result<()>;

    /// Open a stream speaking the first of `protocols` the peer supports
    async fn new_stream(&self, peer: &PeerId, protocols: &[String]) -> Result<Box<dyn MessageStream>>;

    fn set_stream_handler(&self, protocols: Vec<String>, handler: Arc<dyn StreamHandler>);

    fn remove_stream_handler(&self);
}

/// A shareable host handle
pub type HostHandle = Arc<dyn Host>;

/// Pick the first protocol in `wanted` that appears in `supported`
pub fn negotiate<'a>(wanted: &'a [String], supported: &[String]) -> Option<&'a String> {
    wanted.iter().find(|p| supported.contains(p))
}

pub mod memory {
    //! In-process network for tests and simulations
    //!
    //! Every host registered with a [`MemoryNetwork`] can dial every other
    //! host by peer id. Frames are delivered by calling the remote
    //! handler directly, so protocol negotiation and stream resets behave
    //! like a real transport while staying deterministic.

    use super::*;
    use crate::Error;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    type Registration = (Vec<String>, Arc<dyn StreamHandler>);

    #[derive(Default)]
    struct PeerSlot {
        registration: Mutex<Option<Registration>>,
        connections: Mutex<HashSet<PeerId>>,
        peerstore: Mutex<HashMap<PeerId, Vec<String>>>,
    }

    /// A set of hosts that can reach one another in-process
    #[derive(Default)]
    pub struct MemoryNetwork {
        peers: Mutex<HashMap<PeerId, Arc<PeerSlot>>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Register a new host on the network
        pub fn add_host(self: &Arc<Self>, id: PeerId) -> Arc<MemoryHost> {
            let slot = Arc::new(PeerSlot::default());
            self.lock_peers().insert(id, slot.clone());
            Arc::new(MemoryHost {
                id,
                slot,
                network: self.clone(),
            })
        }

        /// Take a host offline; open streams to it reset on next use
        pub fn remove_host(&self, id: &PeerId) {
            self.lock_peers().remove(id);
            for slot in self.lock_peers().values() {
                lock(&slot.connections).remove(id);
            }
        }

        /// Drop the connection between two hosts
        pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
            if let Some(slot) = self.slot(a) {
                lock(&slot.connections).remove(b);
            }
            if let Some(slot) = self.slot(b) {
                lock(&slot.connections).remove(a);
            }
        }

        fn slot(&self, id: &PeerId) -> Option<Arc<PeerSlot>> {
            self.lock_peers().get(id).cloned()
        }

        fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Arc<PeerSlot>>> {
            lock(&self.peers)
        }

        fn link(&self, a: &PeerId, b: &PeerId) -> Result<(Arc<PeerSlot>, Arc<PeerSlot>)> {
            let sa = self
                .slot(a)
                .ok_or_else(|| Error::ConnectionFailed(format!("{} is offline", a.short())))?;
            let sb = self
                .slot(b)
                .ok_or_else(|| Error::ConnectionFailed(format!("{} is unreachable", b.short())))?;
            lock(&sa.connections).insert(*b);
            lock(&sb.connections).insert(*a);
            lock(&sa.peerstore).insert(*b, vec![memory_addr(b)]);
            lock(&sb.peerstore).insert(*a, vec![memory_addr(a)]);
            Ok((sa, sb))
        }
    }

    /// A host on a [`MemoryNetwork`]
    pub struct MemoryHost {
        id: PeerId,
        slot: Arc<PeerSlot>,
        network: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl Host for MemoryHost {
        fn local_peer(&self) -> PeerId {
            self.id
        }

        fn listen_addrs(&self) -> Vec<String> {
            vec![memory_addr(&self.id)]
        }

        fn peer_addrs(&self, peer: &PeerId) -> Vec<String> {
            lock(&self.slot.peerstore).get(peer).cloned().unwrap_or_default()
        }

        fn add_peer_addrs(&self, peer: &PeerId, addrs: &[String]) {
            if addrs.is_empty() || *peer == self.id {
                return;
            }
            let mut store = lock(&self.slot.peerstore);
            let known = store.entry(*peer).or_default();
            for addr in addrs {
                if !known.contains(addr) {
                    known.push(addr.clone());
                }
            }
        }

        fn connectedness(&self, peer: &PeerId) -> Connectedness {
            if lock(&self.slot.connections).contains(peer) {
                Connectedness::Connected
            } else if lock(&self.slot.peerstore).contains_key(peer) {
                Connectedness::CanConnect
            } else {
                Connectedness::NotConnected
            }
        }

        async fn connect(&self, peer: &PeerInfo) -> Result<()> {
            self.network.link(&self.id, &peer.id).map(|_| ())
        }

        async fn new_stream(&self, peer: &PeerId, protocols: &[String]) -> Result<Box<dyn MessageStream>> {
            let (_, remote) = self.network.link(&self.id, peer)?;
            let registration = lock(&remote.registration).clone();
            let protocol = registration
                .as_ref()
                .and_then(|(supported, _)| negotiate(protocols, supported))
                .cloned()
                .ok_or_else(|| Error::ProtocolNotSupported {
                    peer: peer.short(),
                    protocols: protocols.to_vec(),
                })?;

            Ok(Box::new(MemoryStream {
                from: self.id,
                to: *peer,
                protocol,
                network: self.network.clone(),
            }))
        }

        fn set_stream_handler(&self, protocols: Vec<String>, handler: Arc<dyn StreamHandler>) {
            *lock(&self.slot.registration) = Some((protocols, handler));
        }

        fn remove_stream_handler(&self) {
            lock(&self.slot.registration).take();
        }
    }

    struct MemoryStream {
        from: PeerId,
        to: PeerId,
        protocol: String,
        network: Arc<MemoryNetwork>,
    }

    impl MemoryStream {
        /// Resolve the remote handler, failing the way a reset stream would
        fn remote_handler(&self) -> Result<Arc<dyn StreamHandler>> {
            let reset = || Error::StreamReset(format!("stream to {} closed", self.to.short()));
            let remote = self.network.slot(&self.to).ok_or_else(reset)?;
            if !lock(&remote.connections).contains(&self.from) {
                return Err(reset());
            }
            let registration = lock(&remote.registration).clone();
            match registration {
                Some((supported, handler)) if supported.contains(&self.protocol) => Ok(handler),
                _ => Err(reset()),
            }
        }
    }

    #[async_trait]
    impl MessageStream for MemoryStream {
        fn protocol(&self) -> &str {
            &self.protocol
        }

        async fn request(&mut self, payload: Vec<u8>) -> Result<Vec<u8>> {
            let handler = self.remote_handler()?;
            handler
                .handle_frame(self.from, payload, FrameKind::Request)
                .await
                .ok_or_else(|| Error::StreamReset(format!("{} reset the stream", self.to.short())))
        }

        async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
            let handler = self.remote_handler()?;
            let from = self.from;
            tokio::spawn(async move {
                handler.handle_frame(from, payload, FrameKind::OneWay).await;
            });
            Ok(())
        }
    }

    pub fn memory_addr(id: &PeerId) -> String {
        format!("/memory/{}", id.to_hex())
    }

    fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        struct Echo;

        #[async_trait]
        impl StreamHandler for Echo {
            async fn handle_frame(&self, _from: PeerId, payload: Vec<u8>, _kind: FrameKind) -> Option<Vec<u8>> {
                Some(payload)
            }
        }

        fn protos(p: &str) -> Vec<String> {
            vec![p.to_string()]
        }

        #[tokio::test]
        async fn test_memory_request_reply() {
            let net = MemoryNetwork::new();
            let a = net.add_host(PeerId::random());
            let b = net.add_host(PeerId::random());
            b.set_stream_handler(protos("/echo"), Arc::new(Echo));

            let mut stream = a.new_stream(&b.local_peer(), &protos("/echo")).await.unwrap();
            assert_eq!(stream.protocol(), "/echo");
            assert_eq!(stream.request(b"ping".to_vec()).await.unwrap(), b"ping");
            assert_eq!(a.connectedness(&b.local_peer()), Connectedness::Connected);
            assert_eq!(b.peer_addrs(&a.local_peer()), vec![memory_addr(&a.local_peer())]);
        }

        #[tokio::test]
        async fn test_memory_protocol_mismatch() {
            let net = MemoryNetwork::new();
            let a = net.add_host(PeerId::random());
            let b = net.add_host(PeerId::random());
            b.set_stream_handler(protos("/other"), Arc::new(Echo));

            let err = a.new_stream(&b.local_peer(), &protos("/echo")).await.err().unwrap();
            assert!(matches!(err, Error::ProtocolNotSupported { .. }));
        }

        #[tokio::test]
        async fn test_memory_stream_resets_when_peer_leaves() {
            let net = MemoryNetwork::new();
            let a = net.add_host(PeerId::random());
            let b = net.add_host(PeerId::random());
            b.set_stream_handler(protos("/echo"), Arc::new(Echo));

            let mut stream = a.new_stream(&b.local_peer(), &protos("/echo")).await.unwrap();
            net.remove_host(&b.local_peer());
            assert!(matches!(stream.request(vec![1]).await, Err(Error::StreamReset(_))));
        }
    }
}
