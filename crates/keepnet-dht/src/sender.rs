//! Per-peer message senders
//!
//! Each remote peer gets one [`MessageSender`] whose stream is opened
//! lazily and reused across requests. The stream sits behind an async
//! mutex so at most one request is in flight per sender.

use crate::{DhtError, Result};
use keepnet_core::proto::Message;
use keepnet_core::{HostHandle, MessageStream, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::debug;

pub(crate) struct MessageSender {
    peer: PeerId,
    host: HostHandle,
    protocols: Vec<String>,
    request_timeout: Duration,
    stream: AsyncMutex<Option<Box<dyn MessageStream>>>,
}

impl MessageSender {
    fn new(peer: PeerId, host: HostHandle, protocols: Vec<String>, request_timeout: Duration) -> Self {
        Self {
            peer,
            host,
            protocols,
            request_timeout,
            stream: AsyncMutex::new(None),
        }
    }

    /// Send a request and wait for the decoded reply
    pub async fn send_request(&self, msg: &Message) -> Result<Message> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.host.new_stream(&self.peer, &self.protocols).await?);
        }

        let result = match guard.as_mut() {
            Some(stream) => timeout(self.request_timeout, stream.request(msg.to_bytes())).await,
            None => return Err(DhtError::Protocol("no stream".to_string())),
        };

        match result {
            Ok(Ok(reply)) => Ok(Message::from_bytes(&reply)?),
            Ok(Err(e)) => {
                debug!("Request to {} failed: {}", self.peer.short(), e);
                guard.take();
                Err(e.into())
            }
            Err(_) => {
                guard.take();
                Err(DhtError::Timeout)
            }
        }
    }

    /// Send a message without waiting for a reply
    pub async fn send_message(&self, msg: &Message) -> Result<()> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.host.new_stream(&self.peer, &self.protocols).await?);
        }

        let result = match guard.as_mut() {
            Some(stream) => timeout(self.request_timeout, stream.send(msg.to_bytes())).await,
            None => return Err(DhtError::Protocol("no stream".to_string())),
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                guard.take();
                Err(e.into())
            }
            Err(_) => {
                guard.take();
                Err(DhtError::Timeout)
            }
        }
    }
}

/// Senders keyed by destination peer
pub(crate) struct SenderMap {
    host: HostHandle,
    protocols: Vec<String>,
    request_timeout: Duration,
    senders: Mutex<HashMap<PeerId, Arc<MessageSender>>>,
}

impl SenderMap {
    pub fn new(host: HostHandle, protocols: Vec<String>, request_timeout: Duration) -> Self {
        Self {
            host,
            protocols,
            request_timeout,
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, peer: &PeerId) -> Arc<MessageSender> {
        self.lock()
            .entry(*peer)
            .or_insert_with(|| {
                Arc::new(MessageSender::new(
                    *peer,
                    self.host.clone(),
                    self.protocols.clone(),
                    self.request_timeout,
                ))
            })
            .clone()
    }

    /// Drop the sender for `peer`, unless it has already been replaced
    pub fn evict(&self, peer: &PeerId, sender: &Arc<MessageSender>) {
        let mut senders = self.lock();
        if senders.get(peer).is_some_and(|current| Arc::ptr_eq(current, sender)) {
            senders.remove(peer);
        }
    }

    #[cfg(test)]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.lock().contains_key(peer)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Arc<MessageSender>>> {
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use keepnet_core::proto::MessageType;
    use keepnet_core::transport::memory::MemoryNetwork;
    use keepnet_core::{FrameKind, Host, StreamHandler};

    struct Echo;

    #[async_trait]
    impl StreamHandler for Echo {
        async fn handle_frame(&self, _from: PeerId, payload: Vec<u8>, _kind: FrameKind) -> Option<Vec<u8>> {
            Some(payload)
        }
    }

    fn protocols() -> Vec<String> {
        vec![keepnet_core::DEFAULT_PROTOCOL.to_string()]
    }

    #[tokio::test]
    async fn test_sender_is_reused_and_evicted() {
        let net = MemoryNetwork::new();
        let a = net.add_host(PeerId::random());
        let b = net.add_host(PeerId::random());
        b.set_stream_handler(protocols(), Arc::new(Echo));

        let map = SenderMap::new(a.clone(), protocols(), Duration::from_secs(1));
        let s1 = map.get_or_create(&b.local_peer());
        let s2 = map.get_or_create(&b.local_peer());
        assert!(Arc::ptr_eq(&s1, &s2));

        let reply = s1.send_request(&Message::new(MessageType::Ping, Vec::new())).await.unwrap();
        assert_eq!(reply.kind().unwrap(), MessageType::Ping);

        map.evict(&b.local_peer(), &s1);
        assert!(!map.contains(&b.local_peer()));

        // A stale handle must not evict its replacement
        let s3 = map.get_or_create(&b.local_peer());
        map.evict(&b.local_peer(), &s1);
        assert!(map.contains(&b.local_peer()));
        assert!(!Arc::ptr_eq(&s1, &s3));
    }

    #[tokio::test]
    async fn test_request_to_departed_peer_fails() {
        let net = MemoryNetwork::new();
        let a = net.add_host(PeerId::random());
        let b = net.add_host(PeerId::random());
        b.set_stream_handler(protocols(), Arc::new(Echo));

        let map = SenderMap::new(a.clone(), protocols(), Duration::from_secs(1));
        let sender = map.get_or_create(&b.local_peer());
        sender.send_request(&Message::new(MessageType::Ping, Vec::new())).await.unwrap();

        net.remove_host(&b.local_peer());
        assert!(sender.send_request(&Message::new(MessageType::Ping, Vec::new())).await.is_err());
    }
}
