//! The Kademlia DHT node
//!
//! [`KadDht`] owns the routing table, the local record store and the
//! provider manager, answers inbound RPCs through the stream handler it
//! registers on the host, and implements the outbound value, peer and
//! provider operations on top of iterative lookups.

use crate::metainfo::{is_user_init_key, MetaMessageHandler};
use crate::providers::ProviderManager;
use crate::query::{run_lookup, LookupScope, PeerQueryResult};
use crate::record::{LocalStore, PermissiveValidator, Validator};
use crate::routing::RoutingTable;
use crate::sender::SenderMap;
use crate::{DatastoreHandle, DhtConfig, DhtError, Result, RoutingOptions};
use async_trait::async_trait;
use keepnet_core::proto::{Message, MessageType, OpType, Peer, Record};
use keepnet_core::{Connectedness, FrameKind, HostHandle, KadId, PeerId, PeerInfo, StreamHandler};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Values collected by `get_value` when the caller sets no quorum
pub const DEFAULT_GET_QUORUM: usize = 16;

const RESULT_CHANNEL_SIZE: usize = 16;

/// A record and the peer it came from
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWithPeer {
    pub record: Record,
    pub from: PeerId,
}

pub(crate) struct DhtInner {
    pub(crate) self_id: PeerId,
    pub(crate) host: HostHandle,
    pub(crate) config: DhtConfig,
    pub(crate) routing_table: Mutex<RoutingTable>,
    pub(crate) local: LocalStore,
    pub(crate) providers: ProviderManager,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) strmap: SenderMap,
    pub(crate) meta_handler: OnceLock<Arc<dyn MetaMessageHandler>>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) bootstrapping: AtomicBool,
    pub(crate) closed: AtomicBool,
}

impl Drop for DhtInner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// A DHT node; clones share the same node
#[derive(Clone)]
pub struct KadDht {
    pub(crate) inner: Arc<DhtInner>,
}

/// Routes inbound frames to the node without keeping it alive
struct DhtStreamHandler {
    dht: Weak<DhtInner>,
}

#[async_trait]
impl StreamHandler for DhtStreamHandler {
    async fn handle_frame(&self, from: PeerId, payload: Vec<u8>, kind: FrameKind) -> Option<Vec<u8>> {
        let inner = self.dht.upgrade()?;
        KadDht { inner }.handle_frame(from, payload, kind).await
    }
}

impl KadDht {
    /// Create a node with the permissive validator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(host: HostHandle, ds: DatastoreHandle, config: DhtConfig) -> Result<Self> {
        Self::with_validator(host, ds, config, Arc::new(PermissiveValidator))
    }

    pub fn with_validator(
        host: HostHandle,
        ds: DatastoreHandle,
        config: DhtConfig,
        validator: Arc<dyn Validator>,
    ) -> Result<Self> {
        config.validate()?;
        let self_id = host.local_peer();

        let inner = Arc::new(DhtInner {
            self_id,
            routing_table: Mutex::new(RoutingTable::new(self_id, config.k)),
            local: LocalStore::new(ds.clone()),
            providers: ProviderManager::new(ds, &config.providers),
            validator,
            strmap: SenderMap::new(host.clone(), config.protocols.clone(), config.request_timeout),
            meta_handler: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
            bootstrapping: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            host,
            config,
        });

        inner.host.set_stream_handler(
            inner.config.protocols.clone(),
            Arc::new(DhtStreamHandler {
                dht: Arc::downgrade(&inner),
            }),
        );
        info!("DHT node {} listening on {:?}", self_id.short(), inner.config.protocols);

        Ok(Self { inner })
    }

    pub fn self_id(&self) -> PeerId {
        self.inner.self_id
    }

    pub fn host(&self) -> &HostHandle {
        &self.inner.host
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.inner.local
    }

    pub fn providers(&self) -> &ProviderManager {
        &self.inner.providers
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing_table().len()
    }

    pub fn routing_table_peers(&self) -> Vec<PeerId> {
        self.routing_table().list_peers()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop background tasks and stop answering requests
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.inner.providers.close().await;
        self.inner.host.remove_stream_handler();
        self.inner.strmap.clear();
        info!("DHT node {} closed", self.inner.self_id.short());
    }

    /// Store a value locally and on the K closest peers
    pub async fn put_value(&self, key: &str, value: Vec<u8>, opts: RoutingOptions) -> Result<()> {
        self.ensure_open()?;
        self.inner.validator.validate(key, &value)?;

        if let Some(old) = self.inner.local.get_local(key)? {
            if old.value != value {
                let i = self
                    .inner
                    .validator
                    .select(key, &[value.as_slice(), old.value.as_slice()])?;
                if i != 0 {
                    return Err(DhtError::StaleRecord);
                }
            }
        }

        let rec = Record::new(key, value);
        self.inner.local.put_local(key, &rec)?;
        if opts.offline {
            return Ok(());
        }

        let peers = self.get_closest_peers(key.as_bytes()).await?;
        debug!("Putting {} to {} peers", key, peers.len());

        let mut tasks = JoinSet::new();
        for peer in peers {
            let dht = self.clone();
            let rec = rec.clone();
            tasks.spawn(async move { dht.put_value_to_peer(&peer, rec).await });
        }

        let needed = opts.quorum.unwrap_or(1).max(1);
        let mut acked = 0;
        let mut failed = 0;
        let mut last = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => acked += 1,
                Ok(Err(e)) => {
                    failed += 1;
                    last = Some(e);
                }
                Err(e) => {
                    failed += 1;
                    last = Some(DhtError::Protocol(e.to_string()));
                }
            }
        }

        if acked >= needed {
            Ok(())
        } else if acked == 0 {
            Err(DhtError::Aggregate {
                failed,
                last: Box::new(last.unwrap_or(DhtError::NotFound)),
            })
        } else {
            Err(DhtError::QuorumNotReached { acked, needed })
        }
    }

    /// Send one PUT_VALUE and check the echoed record
    pub(crate) async fn put_value_to_peer(&self, peer: &PeerId, rec: Record) -> Result<()> {
        let mut msg = Message::new(MessageType::PutValue, rec.key.clone());
        let sent = rec.value.clone();
        msg.record = Some(rec);

        let resp = self.send_request(peer, &msg).await?;
        match resp.record {
            Some(echo) if echo.value == sent => Ok(()),
            _ => Err(DhtError::Protocol("value not put correctly".to_string())),
        }
    }

    /// The best value for `key` among those found locally and on the network
    pub async fn get_value(&self, key: &str, opts: RoutingOptions) -> Result<Vec<u8>> {
        self.ensure_open()?;
        if opts.offline {
            return self.local_value(key)?.ok_or(DhtError::NotFound);
        }

        let values = self.get_values(key, opts.quorum.unwrap_or(DEFAULT_GET_QUORUM)).await?;
        if values.is_empty() {
            return Err(DhtError::NotFound);
        }

        let candidates: Vec<&[u8]> = values.iter().map(|v| v.record.value.as_slice()).collect();
        let best = self.inner.validator.select(key, &candidates)?;
        let best = values
            .get(best)
            .map(|v| v.record.value.clone())
            .ok_or_else(|| DhtError::InvalidRecord("validator selected a missing value".to_string()))?;

        self.fix_outdated(key, &best, &values);
        Ok(best)
    }

    /// Collect up to `n` valid values; `n == 0` collects every value found
    pub async fn get_values(&self, key: &str, n: usize) -> Result<Vec<RecordWithPeer>> {
        self.ensure_open()?;
        let mut rx = self.spawn_value_search(key.to_string(), n);

        let mut values = Vec::new();
        let mut last_err = None;
        while let Some(item) = rx.recv().await {
            match item {
                Ok(v) => values.push(v),
                Err(e) => last_err = Some(e),
            }
        }

        match last_err {
            Some(e) if values.is_empty() => Err(e),
            _ => Ok(values),
        }
    }

    /// Stream successively better values for `key`
    pub async fn search_value(&self, key: &str, opts: RoutingOptions) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_SIZE);

        if opts.offline {
            if let Some(value) = self.local_value(key)? {
                let _ = tx.send(value).await;
            }
            return Ok(rx);
        }

        let mut found = self.spawn_value_search(key.to_string(), opts.quorum.unwrap_or(DEFAULT_GET_QUORUM));
        let validator = self.inner.validator.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let mut best: Option<Vec<u8>> = None;
            while let Some(item) = found.recv().await {
                let value = match item {
                    Ok(v) => v.record.value,
                    Err(e) => {
                        debug!("Value search for {} ended: {}", key, e);
                        continue;
                    }
                };
                let better = match &best {
                    None => true,
                    Some(current) => {
                        value != *current
                            && matches!(validator.select(&key, &[value.as_slice(), current.as_slice()]), Ok(0))
                    }
                };
                if better {
                    best = Some(value.clone());
                    if tx.send(value).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn local_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.local.get_local(key)?.map(|r| r.value))
    }

    /// Run a value search in the background, sending each valid record found.
    ///
    /// A lookup error is sent only when no record was found. The search
    /// stops once `n` records were sent or the receiver is dropped.
    fn spawn_value_search(&self, key: String, n: usize) -> mpsc::Receiver<Result<RecordWithPeer>> {
        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_SIZE);
        let limit = if n == 0 { usize::MAX } else { n };
        let dht = self.clone();

        tokio::spawn(async move {
            let found = Arc::new(AtomicUsize::new(0));

            match dht.inner.local.get_local(&key) {
                Ok(Some(rec)) if dht.inner.validator.validate(&key, &rec.value).is_ok() => {
                    found.fetch_add(1, Ordering::SeqCst);
                    let local = RecordWithPeer {
                        record: rec,
                        from: dht.inner.self_id,
                    };
                    if tx.send(Ok(local)).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to read local record {}: {}", key, e),
            }
            if found.load(Ordering::SeqCst) >= limit {
                return;
            }

            let broadcast = is_user_init_key(&key);
            let (scope, op) = if broadcast {
                (LookupScope::Broadcast, OpType::BroadCast)
            } else {
                (LookupScope::Nearest, OpType::Unary)
            };

            let query = {
                let dht = dht.clone();
                let tx = tx.clone();
                let key = key.clone();
                let found = found.clone();
                move |peer: PeerId| {
                    let dht = dht.clone();
                    let tx = tx.clone();
                    let key = key.clone();
                    let found = found.clone();
                    async move {
                        if tx.is_closed() || found.load(Ordering::SeqCst) >= limit {
                            return Ok(PeerQueryResult::done());
                        }

                        let msg = Message::new(MessageType::GetValue, key.as_bytes()).with_op(op);
                        let resp = dht.send_request(&peer, &msg).await?;
                        let closer = resp.closer_peer_infos();

                        if let Some(rec) = resp.record {
                            if rec.key != key.as_bytes() {
                                debug!("Discarding record for the wrong key from {}", peer.short());
                            } else if let Err(e) = dht.inner.validator.validate(&key, &rec.value) {
                                debug!("Discarding invalid record from {}: {}", peer.short(), e);
                            } else {
                                let count = found.fetch_add(1, Ordering::SeqCst) + 1;
                                if tx.send(Ok(RecordWithPeer { record: rec, from: peer })).await.is_err()
                                    || count >= limit
                                {
                                    return Ok(PeerQueryResult::done());
                                }
                            }
                        }
                        Ok(PeerQueryResult::closer(closer))
                    }
                }
            };

            let result = run_lookup(&dht, key.as_bytes(), scope, query).await;
            if found.load(Ordering::SeqCst) > 0 {
                return;
            }
            let err = match result {
                Ok(outcome) => outcome.failure(),
                Err(e) => Some(e),
            };
            if let Some(e) = err {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    /// Correct the local store and remote peers that returned an older value
    fn fix_outdated(&self, key: &str, best: &[u8], values: &[RecordWithPeer]) {
        let mut stale = Vec::new();
        for v in values.iter().filter(|v| v.record.value != best) {
            if v.from == self.inner.self_id {
                if let Err(e) = self.inner.local.put_local(key, &Record::new(key, best.to_vec())) {
                    warn!("Failed to correct local record {}: {}", key, e);
                }
            } else {
                stale.push(v.from);
            }
        }
        if stale.is_empty() {
            return;
        }

        let dht = self.clone();
        let rec = Record::new(key, best.to_vec());
        tokio::spawn(async move {
            for peer in stale {
                if let Err(e) = dht.put_value_to_peer(&peer, rec.clone()).await {
                    debug!("Failed to correct record on {}: {}", peer.short(), e);
                }
            }
        });
    }

    /// The K closest responsive peers to `key`, found by iterative lookup
    pub async fn get_closest_peers(&self, key: &[u8]) -> Result<Vec<PeerId>> {
        self.ensure_open()?;
        let dht = self.clone();
        let target = key.to_vec();

        let outcome = run_lookup(self, key, LookupScope::Nearest, move |peer: PeerId| {
            let dht = dht.clone();
            let target = target.clone();
            async move {
                let resp = dht
                    .send_request(&peer, &Message::new(MessageType::FindNode, target))
                    .await?;
                Ok(PeerQueryResult::closer(resp.closer_peer_infos()))
            }
        })
        .await?;

        if outcome.closest.is_empty() {
            if let Some(e) = outcome.failure() {
                return Err(e);
            }
            return Ok(Vec::new());
        }
        Ok(outcome.closest)
    }

    /// Locate a peer's addresses
    pub async fn find_peer(&self, id: &PeerId) -> Result<PeerInfo> {
        self.ensure_open()?;
        let host = &self.inner.host;
        if *id == self.inner.self_id {
            return Ok(PeerInfo::new(*id, host.listen_addrs()));
        }
        if host.connectedness(id) == Connectedness::Connected {
            return Ok(PeerInfo::new(*id, host.peer_addrs(id)));
        }

        let target = *id;
        let seen_target = Arc::new(AtomicBool::new(false));
        let dht = self.clone();
        let flag = seen_target.clone();
        let outcome = run_lookup(self, id.as_bytes(), LookupScope::Nearest, move |peer: PeerId| {
            let dht = dht.clone();
            let flag = flag.clone();
            async move {
                if peer == target {
                    flag.store(true, Ordering::SeqCst);
                    return Ok(PeerQueryResult::done());
                }
                let resp = dht
                    .send_request(&peer, &Message::new(MessageType::FindNode, target.to_vec()))
                    .await?;
                let closer = resp.closer_peer_infos();
                if closer.iter().any(|p| p.id == target && !p.addrs.is_empty()) {
                    flag.store(true, Ordering::SeqCst);
                }
                Ok(PeerQueryResult::closer(closer))
            }
        })
        .await?;

        let addrs = host.peer_addrs(id);
        if seen_target.load(Ordering::SeqCst) && !addrs.is_empty() {
            return Ok(PeerInfo::new(*id, addrs));
        }
        Err(outcome.failure().unwrap_or(DhtError::NotFound))
    }

    /// Dial a peer and admit it to the routing table if it speaks our protocol
    pub async fn connect_peer(&self, info: &PeerInfo) -> Result<()> {
        self.ensure_open()?;
        self.inner.host.add_peer_addrs(&info.id, &info.addrs);
        self.inner.host.connect(info).await?;
        self.ping(&info.id).await
    }

    /// One PING round trip
    pub async fn ping(&self, peer: &PeerId) -> Result<()> {
        let resp = self
            .send_request(peer, &Message::new(MessageType::Ping, Vec::new()))
            .await?;
        if resp.kind()? != MessageType::Ping {
            return Err(DhtError::Protocol("got unexpected response type".to_string()));
        }
        Ok(())
    }

    /// Record ourselves as a provider of `cid`, announcing it when asked
    pub async fn provide(&self, cid: &[u8], announce: bool) -> Result<()> {
        self.ensure_open()?;
        self.inner.providers.add_provider(cid, self.inner.self_id).await?;
        if !announce {
            return Ok(());
        }

        let addrs = self.inner.host.listen_addrs();
        if addrs.is_empty() {
            return Err(DhtError::Protocol("no known addresses for self, cannot announce".to_string()));
        }

        let peers = self.get_closest_peers(cid).await?;
        let mut msg = Message::new(MessageType::AddProvider, cid);
        msg.provider_peers = vec![Peer::from_info(
            &PeerInfo::new(self.inner.self_id, addrs),
            Connectedness::Connected,
        )];

        let mut tasks = JoinSet::new();
        for peer in peers {
            let dht = self.clone();
            let msg = msg.clone();
            tasks.spawn(async move { dht.send_message(&peer, &msg).await });
        }

        let mut sent = 0;
        let mut failed = 0;
        let mut last = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => sent += 1,
                Ok(Err(e)) => {
                    failed += 1;
                    last = Some(e);
                }
                Err(e) => {
                    failed += 1;
                    last = Some(DhtError::Protocol(e.to_string()));
                }
            }
        }

        match last {
            Some(last) if sent == 0 => Err(DhtError::Aggregate {
                failed,
                last: Box::new(last),
            }),
            _ => {
                debug!("Announced provider record to {} peers", sent);
                Ok(())
            }
        }
    }

    /// Stream up to `count` providers of `cid`; `count == 0` means unbounded
    pub fn find_providers_async(&self, cid: &[u8], count: usize) -> mpsc::Receiver<PeerInfo> {
        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_SIZE);
        let dht = self.clone();
        let key = cid.to_vec();
        tokio::spawn(async move { dht.find_providers_routine(key, count, tx).await });
        rx
    }

    async fn find_providers_routine(&self, key: Vec<u8>, count: usize, tx: mpsc::Sender<PeerInfo>) {
        let limit = if count == 0 { usize::MAX } else { count };
        let seen: Arc<Mutex<HashSet<PeerId>>> = Arc::new(Mutex::new(HashSet::new()));

        match self.inner.providers.get_providers(&key).await {
            Ok(local) => {
                for peer in local {
                    if !claim(&seen, peer, limit) {
                        return;
                    }
                    let addrs = if peer == self.inner.self_id {
                        self.inner.host.listen_addrs()
                    } else {
                        self.inner.host.peer_addrs(&peer)
                    };
                    if tx.send(PeerInfo::new(peer, addrs)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!("Failed to read local providers: {}", e),
        }
        if lock(&seen).len() >= limit {
            return;
        }

        let dht = self.clone();
        let target = key.clone();
        let result = run_lookup(self, &key, LookupScope::Nearest, move |peer: PeerId| {
            let dht = dht.clone();
            let target = target.clone();
            let seen = seen.clone();
            let tx = tx.clone();
            async move {
                let full = lock(&seen).len() >= limit;
                if full || tx.is_closed() {
                    return Ok(PeerQueryResult::done());
                }
                let resp = dht
                    .send_request(&peer, &Message::new(MessageType::GetProviders, target))
                    .await?;

                for info in resp.provider_peer_infos() {
                    dht.inner.host.add_peer_addrs(&info.id, &info.addrs);
                    if !claim(&seen, info.id, limit) {
                        continue;
                    }
                    if tx.send(info).await.is_err() {
                        return Ok(PeerQueryResult::done());
                    }
                }
                let reached = lock(&seen).len() >= limit;
                if reached {
                    return Ok(PeerQueryResult::done());
                }
                Ok(PeerQueryResult::closer(resp.closer_peer_infos()))
            }
        })
        .await;

        if let Err(e) = result {
            debug!("Provider lookup ended: {}", e);
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DhtError::Closed);
        }
        Ok(())
    }

    pub(crate) fn routing_table(&self) -> MutexGuard<'_, RoutingTable> {
        lock(&self.inner.routing_table)
    }

    pub(crate) fn nearest_peers(&self, target: &KadId, count: usize) -> Vec<PeerId> {
        self.routing_table().nearest_peers(target, count)
    }

    /// Note a live peer in the routing table
    pub(crate) fn peer_seen(&self, peer: PeerId) {
        if !self.routing_table().update(peer) {
            debug!("Routing table has no room for {}", peer.short());
        }
    }

    pub(crate) async fn send_request(&self, peer: &PeerId, msg: &Message) -> Result<Message> {
        let sender = self.inner.strmap.get_or_create(peer);
        match sender.send_request(msg).await {
            Ok(resp) => {
                self.peer_seen(*peer);
                Ok(resp)
            }
            Err(e) => {
                self.on_send_error(peer, &sender, &e);
                Err(e)
            }
        }
    }

    pub(crate) async fn send_message(&self, peer: &PeerId, msg: &Message) -> Result<()> {
        let sender = self.inner.strmap.get_or_create(peer);
        match sender.send_message(msg).await {
            Ok(()) => {
                self.peer_seen(*peer);
                Ok(())
            }
            Err(e) => {
                self.on_send_error(peer, &sender, &e);
                Err(e)
            }
        }
    }

    fn on_send_error(&self, peer: &PeerId, sender: &Arc<crate::sender::MessageSender>, err: &DhtError) {
        self.inner.strmap.evict(peer, sender);
        if is_unreachable(err) && self.routing_table().remove(peer) {
            debug!("Removed unreachable peer {}: {}", peer.short(), err);
        }
    }
}

/// Failures that mean the peer cannot serve the DHT protocol at all
fn is_unreachable(err: &DhtError) -> bool {
    matches!(
        err,
        DhtError::Transport(keepnet_core::Error::ConnectionFailed(_))
            | DhtError::Transport(keepnet_core::Error::ProtocolNotSupported { .. })
    )
}

/// Reserve a slot for `peer` in the output set; false once the set is full or the peer was seen
fn claim(seen: &Mutex<HashSet<PeerId>>, peer: PeerId, limit: usize) -> bool {
    let mut seen = lock(seen);
    seen.len() < limit && seen.insert(peer)
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
