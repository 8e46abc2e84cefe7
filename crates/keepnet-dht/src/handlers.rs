//! Inbound RPC dispatch

use crate::dht::KadDht;
use crate::metainfo::MetaRequest;
use crate::{DhtError, Result};
use keepnet_core::proto::{Message, MessageType, Peer};
use keepnet_core::{Connectedness, FrameKind, KadId, PeerId, PeerInfo};
use tracing::debug;

impl KadDht {
    /// Decode, dispatch and encode one inbound frame
    pub(crate) async fn handle_frame(&self, from: PeerId, payload: Vec<u8>, kind: FrameKind) -> Option<Vec<u8>> {
        if self.is_closed() {
            return None;
        }
        let msg = match Message::from_bytes(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Undecodable message from {}: {}", from.short(), e);
                return None;
            }
        };

        self.peer_seen(from);

        match self.handle_message(from, msg).await {
            Ok(Some(resp)) if kind == FrameKind::Request => Some(resp.to_bytes()),
            Ok(_) => None,
            Err(e) => {
                debug!("Error handling message from {}: {}", from.short(), e);
                None
            }
        }
    }

    pub(crate) async fn handle_message(&self, from: PeerId, msg: Message) -> Result<Option<Message>> {
        let kind = msg.kind()?;
        debug!("Handling {:?} from {}", kind, from.short());

        match kind {
            MessageType::GetValue => self.handle_get_value(from, msg).map(Some),
            MessageType::PutValue => self.handle_put_value(msg).map(Some),
            MessageType::FindNode => Ok(Some(self.handle_find_node(from, msg))),
            MessageType::GetProviders => self.handle_get_providers(from, msg).await.map(Some),
            MessageType::AddProvider => self.handle_add_provider(from, msg).await.map(|_| None),
            MessageType::Ping => Ok(Some(msg)),
            MessageType::MetaInfo => self.handle_meta_info(from, msg).await,
        }
    }

    fn handle_get_value(&self, from: PeerId, msg: Message) -> Result<Message> {
        let key = key_string(&msg.key)?;

        let mut resp = Message::new(MessageType::GetValue, msg.key.clone()).with_op(msg.op());
        resp.record = self.inner.local.get_local(&key)?;
        resp.closer_peers = self.better_peers(&msg.key, &from);
        Ok(resp)
    }

    fn handle_put_value(&self, msg: Message) -> Result<Message> {
        let key = key_string(&msg.key)?;
        let mut rec = msg
            .record
            .clone()
            .ok_or_else(|| DhtError::Protocol("nil record".to_string()))?;
        if rec.key != msg.key {
            return Err(DhtError::Protocol("put key doesn't match record key".to_string()));
        }

        self.inner.validator.validate(&key, &rec.value)?;
        if let Some(old) = self.inner.local.get_local(&key)? {
            if old.value != rec.value {
                let i = self
                    .inner
                    .validator
                    .select(&key, &[rec.value.as_slice(), old.value.as_slice()])?;
                if i != 0 {
                    return Err(DhtError::StaleRecord);
                }
            }
        }

        rec.time_received = keepnet_core::unix_nanos();
        self.inner.local.put_local(&key, &rec)?;
        Ok(msg)
    }

    fn handle_find_node(&self, from: PeerId, msg: Message) -> Message {
        let mut resp = Message::new(MessageType::FindNode, msg.key.clone());

        if msg.key == self.inner.self_id.as_bytes() {
            let me = PeerInfo::new(self.inner.self_id, self.inner.host.listen_addrs());
            resp.closer_peers = vec![Peer::from_info(&me, Connectedness::Connected)];
            return resp;
        }

        let mut closer = self.better_peers(&msg.key, &from);
        // A connected target is returned even when it is not in our table
        if let Ok(target) = PeerId::try_from_slice(&msg.key) {
            let host = &self.inner.host;
            if target != from
                && host.connectedness(&target) == Connectedness::Connected
                && !closer.iter().any(|p| p.id == msg.key)
            {
                let info = PeerInfo::new(target, host.peer_addrs(&target));
                closer.push(Peer::from_info(&info, Connectedness::Connected));
            }
        }
        resp.closer_peers = closer;
        resp
    }

    async fn handle_get_providers(&self, from: PeerId, msg: Message) -> Result<Message> {
        if msg.key.is_empty() {
            return Err(DhtError::Protocol("no key was provided".to_string()));
        }
        let mut resp = Message::new(MessageType::GetProviders, msg.key.clone());

        let mut providers = self.inner.providers.get_providers(&msg.key).await?;
        if let Ok(key) = std::str::from_utf8(&msg.key) {
            if !providers.contains(&self.inner.self_id) && self.inner.local.datastore().has(key)? {
                providers.push(self.inner.self_id);
            }
        }

        let host = &self.inner.host;
        resp.provider_peers = providers
            .into_iter()
            .map(|p| {
                let addrs = if p == self.inner.self_id {
                    host.listen_addrs()
                } else {
                    host.peer_addrs(&p)
                };
                Peer::from_info(&PeerInfo::new(p, addrs), host.connectedness(&p))
            })
            .collect();
        resp.closer_peers = self.better_peers(&msg.key, &from);
        Ok(resp)
    }

    async fn handle_add_provider(&self, from: PeerId, msg: Message) -> Result<()> {
        if msg.key.is_empty() {
            return Err(DhtError::Protocol("no key was provided".to_string()));
        }

        for info in msg.provider_peer_infos() {
            if info.id != from {
                debug!("Ignoring provider record for {} sent by {}", info.id.short(), from.short());
                continue;
            }
            if info.addrs.is_empty() {
                debug!("Ignoring provider record from {} without addresses", from.short());
                continue;
            }
            self.inner.host.add_peer_addrs(&info.id, &info.addrs);
            self.inner.providers.add_provider(&msg.key, info.id).await?;
        }
        Ok(())
    }

    async fn handle_meta_info(&self, from: PeerId, msg: Message) -> Result<Option<Message>> {
        let key = key_string(&msg.key)?;
        let req = MetaRequest {
            from,
            key,
            value: msg.record.as_ref().map(|r| r.value.clone()).unwrap_or_default(),
            caller: msg.caller.clone(),
            op: msg.op(),
        };

        let reply = self.dispatch_meta(req).await?;
        let mut resp = Message::new(MessageType::MetaInfo, msg.key.clone());
        resp.caller = msg.caller;
        if let Some(value) = reply {
            resp.record = Some(keepnet_core::proto::Record::new(msg.key, value));
        }
        Ok(Some(resp))
    }

    /// Closer peers for a response, never including ourselves or the requester
    fn better_peers(&self, key: &[u8], requester: &PeerId) -> Vec<Peer> {
        let k = self.inner.config.k;
        let target = KadId::from_key(key);
        let host = &self.inner.host;

        self.nearest_peers(&target, k + 1)
            .into_iter()
            .filter(|p| p != requester && *p != self.inner.self_id)
            .take(k)
            .filter_map(|p| {
                let addrs = host.peer_addrs(&p);
                if addrs.is_empty() {
                    return None;
                }
                Some(Peer::from_info(&PeerInfo::new(p, addrs), host.connectedness(&p)))
            })
            .collect()
    }
}

fn key_string(key: &[u8]) -> Result<String> {
    if key.is_empty() {
        return Err(DhtError::Protocol("no key was provided".to_string()));
    }
    String::from_utf8(key.to_vec()).map_err(|_| DhtError::Protocol("key is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DhtConfig, MemoryDatastore};
    use keepnet_core::proto::Record;
    use keepnet_core::transport::memory::MemoryNetwork;
    use std::sync::Arc;

    fn node(net: &Arc<MemoryNetwork>) -> KadDht {
        let host = net.add_host(PeerId::random());
        KadDht::new(host, Arc::new(MemoryDatastore::new()), DhtConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_put_value_rejects_malformed_requests() {
        let net = MemoryNetwork::new();
        let dht = node(&net);
        let from = PeerId::random();

        let nil_record = Message::new(MessageType::PutValue, "k");
        assert!(matches!(
            dht.handle_message(from, nil_record).await,
            Err(DhtError::Protocol(_))
        ));

        let mut mismatch = Message::new(MessageType::PutValue, "k");
        mismatch.record = Some(Record::new("other", "v"));
        assert!(matches!(dht.handle_message(from, mismatch).await, Err(DhtError::Protocol(_))));

        let mut bad_utf8 = Message::new(MessageType::PutValue, vec![0xff, 0xfe]);
        bad_utf8.record = Some(Record::new(vec![0xff, 0xfe], "v"));
        assert!(matches!(dht.handle_message(from, bad_utf8).await, Err(DhtError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_put_then_get_value_handlers() {
        let net = MemoryNetwork::new();
        let dht = node(&net);
        let from = PeerId::random();

        let mut put = Message::new(MessageType::PutValue, "k");
        put.record = Some(Record::new("k", "v"));
        let echo = dht.handle_message(from, put).await.unwrap().unwrap();
        assert_eq!(echo.record.unwrap().value, b"v");

        let resp = dht
            .handle_message(from, Message::new(MessageType::GetValue, "k"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.record.unwrap().value, b"v");

        let missing = dht
            .handle_message(from, Message::new(MessageType::GetValue, "nope"))
            .await
            .unwrap()
            .unwrap();
        assert!(missing.record.is_none());
    }

    #[tokio::test]
    async fn test_find_node_for_self() {
        let net = MemoryNetwork::new();
        let dht = node(&net);

        let resp = dht
            .handle_message(PeerId::random(), Message::new(MessageType::FindNode, dht.self_id().to_vec()))
            .await
            .unwrap()
            .unwrap();
        let peers = resp.closer_peer_infos();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, dht.self_id());
    }

    #[tokio::test]
    async fn test_add_provider_only_from_sender() {
        let net = MemoryNetwork::new();
        let dht = node(&net);
        let sender = PeerId::random();
        let other = PeerId::random();

        let mut msg = Message::new(MessageType::AddProvider, "cid");
        msg.provider_peers = vec![
            Peer::from_info(&PeerInfo::new(other, vec!["/memory/x".to_string()]), Connectedness::Connected),
            Peer::from_info(&PeerInfo::new(sender, vec![]), Connectedness::Connected),
        ];
        assert!(dht.handle_message(sender, msg).await.unwrap().is_none());
        assert!(dht.providers().get_providers(b"cid").await.unwrap().is_empty());

        let mut msg = Message::new(MessageType::AddProvider, "cid");
        msg.provider_peers = vec![Peer::from_info(
            &PeerInfo::new(sender, vec!["/memory/s".to_string()]),
            Connectedness::Connected,
        )];
        dht.handle_message(sender, msg).await.unwrap();
        assert_eq!(dht.providers().get_providers(b"cid").await.unwrap(), vec![sender]);
    }

    #[tokio::test]
    async fn test_get_providers_includes_self_when_hosting() {
        let net = MemoryNetwork::new();
        let dht = node(&net);
        dht.local_store().put_local("content", &Record::new("content", "data")).unwrap();

        let resp = dht
            .handle_message(PeerId::random(), Message::new(MessageType::GetProviders, "content"))
            .await
            .unwrap()
            .unwrap();
        let providers = resp.provider_peer_infos();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].id, dht.self_id());
    }

    #[tokio::test]
    async fn test_meta_info_without_handler() {
        let net = MemoryNetwork::new();
        let dht = node(&net);
        let msg = Message::new(MessageType::MetaInfo, "k");
        assert!(matches!(
            dht.handle_message(PeerId::random(), msg).await,
            Err(DhtError::NoMetaHandler)
        ));
    }
}
