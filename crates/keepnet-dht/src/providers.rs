//! Provider registry
//!
//! A single task owns the provider cache and the batched datastore
//! writer. Callers talk to it through [`ProviderManager`], a cheap
//! cloneable handle around the command channel.
//!
//! Entries are persisted as `/providers/<base32(key)>/<base32(peer)>`
//! with the time the announcement was seen as an unsigned varint of unix
//! nanoseconds. A periodic collection round drops entries older than the
//! provide validity.

use crate::datastore::{AutoBatch, DatastoreHandle};
use crate::{DhtError, ProviderConfig, Result};
use keepnet_core::{unix_nanos, PeerId};
use lru::LruCache;
use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Datastore prefix shared by every provider entry
pub const PROVIDERS_PREFIX: &str = "/providers/";

const COMMAND_QUEUE: usize = 256;

/// Wall clock used to stamp and expire provider entries
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        unix_nanos()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(start_nanos),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

enum Command {
    AddProvider {
        key: Vec<u8>,
        peer: PeerId,
    },
    GetProviders {
        key: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<PeerId>>>,
    },
    RunGc {
        reply: oneshot::Sender<()>,
    },
    Quit,
}

/// Handle to the provider manager task
#[derive(Clone)]
pub struct ProviderManager {
    tx: mpsc::Sender<Command>,
}

impl ProviderManager {
    /// Spawn the manager task; must be called from within a tokio runtime
    pub fn new(ds: DatastoreHandle, config: &ProviderConfig) -> Self {
        Self::with_clock(ds, config, Arc::new(SystemClock))
    }

    pub fn with_clock(ds: DatastoreHandle, config: &ProviderConfig, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);

        let actor = ProviderActor {
            rx,
            store: AutoBatch::new(ds, config.batch_size),
            cache: LruCache::new(cache_size),
            clock,
            validity: config.provide_validity.as_nanos() as u64,
            cleanup_interval: config.cleanup_interval.max(Duration::from_millis(1)),
            gc: None,
        };
        tokio::spawn(actor.run());

        Self { tx }
    }

    /// Record that `peer` provides `key`
    pub async fn add_provider(&self, key: &[u8], peer: PeerId) -> Result<()> {
        self.tx
            .send(Command::AddProvider {
                key: key.to_vec(),
                peer,
            })
            .await
            .map_err(|_| DhtError::Closed)
    }

    /// Known providers of `key`, as an owned copy
    pub async fn get_providers(&self, key: &[u8]) -> Result<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetProviders {
                key: key.to_vec(),
                reply,
            })
            .await
            .map_err(|_| DhtError::Closed)?;
        rx.await.map_err(|_| DhtError::Closed)?
    }

    /// Run a collection round now and wait for it to finish
    pub async fn run_gc(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::RunGc { reply })
            .await
            .map_err(|_| DhtError::Closed)?;
        rx.await.map_err(|_| DhtError::Closed)
    }

    /// Stop the manager task, flushing pending writes
    pub async fn close(&self) {
        let _ = self.tx.send(Command::Quit).await;
    }
}

/// Providers of one key with the time each was last seen
#[derive(Default)]
struct ProviderSet {
    providers: Vec<PeerId>,
    set_at: Vec<u64>,
    index: HashMap<PeerId, usize>,
}

impl ProviderSet {
    fn set_val(&mut self, peer: PeerId, at: u64) {
        match self.index.get(&peer) {
            Some(&i) => self.set_at[i] = at,
            None => {
                self.index.insert(peer, self.providers.len());
                self.providers.push(peer);
                self.set_at.push(at);
            }
        }
    }

    /// Providers seen within `validity` of `now`
    fn live(&self, now: u64, validity: u64) -> Vec<PeerId> {
        self.providers
            .iter()
            .zip(&self.set_at)
            .filter(|(_, at)| now.saturating_sub(**at) <= validity)
            .map(|(p, _)| *p)
            .collect()
    }
}

/// State of an in-progress collection round
struct GcRound {
    pending: VecDeque<(String, Vec<u8>)>,
    /// Entries rewritten since the snapshot was taken
    skip: HashSet<String>,
    waiters: Vec<oneshot::Sender<()>>,
}

struct ProviderActor {
    rx: mpsc::Receiver<Command>,
    store: AutoBatch,
    cache: LruCache<Vec<u8>, ProviderSet>,
    clock: Arc<dyn Clock>,
    validity: u64,
    cleanup_interval: Duration,
    gc: Option<GcRound>,
}

impl ProviderActor {
    async fn run(mut self) {
        let mut tick = interval_at(Instant::now() + self.cleanup_interval, self.cleanup_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                cmd = self.rx.recv() => match cmd {
                    Some(Command::AddProvider { key, peer }) => {
                        if let Err(e) = self.add_provider(key, peer) {
                            warn!("Failed to add provider: {}", e);
                        }
                    }
                    Some(Command::GetProviders { key, reply }) => {
                        let _ = reply.send(self.get_providers(&key));
                    }
                    Some(Command::RunGc { reply }) => self.start_gc(Some(reply)),
                    Some(Command::Quit) | None => break,
                },
                _ = tick.tick() => self.start_gc(None),
                _ = std::future::ready(()), if self.gc.is_some() => self.gc_step(),
            }
        }

        if let Err(e) = self.store.flush() {
            warn!("Failed to flush provider store on shutdown: {}", e);
        }
        debug!("Provider manager stopped");
    }

    fn add_provider(&mut self, key: Vec<u8>, peer: PeerId) -> Result<()> {
        let now = self.clock.now_nanos();
        if let Some(set) = self.cache.get_mut(&key) {
            set.set_val(peer, now);
        }

        let dskey = provider_key(&key, &peer);
        if let Some(gc) = self.gc.as_mut() {
            gc.skip.insert(dskey.clone());
        }
        self.store.put(dskey, encode_time(now))?;
        Ok(())
    }

    fn get_providers(&mut self, key: &[u8]) -> Result<Vec<PeerId>> {
        let now = self.clock.now_nanos();
        if let Some(set) = self.cache.get(key) {
            return Ok(set.live(now, self.validity));
        }

        let set = self.load_provider_set(key)?;
        let providers = set.providers.clone();
        if !providers.is_empty() {
            self.cache.put(key.to_vec(), set);
        }
        Ok(providers)
    }

    /// Read a provider set from disk, deleting entries that are expired or unreadable
    fn load_provider_set(&mut self, key: &[u8]) -> Result<ProviderSet> {
        let prefix = provider_key_prefix(key);
        let now = self.clock.now_nanos();
        let mut set = ProviderSet::default();

        for (dskey, value) in self.store.query_prefix(&prefix)? {
            let peer = base32_decode(&dskey[prefix.len()..])
                .and_then(|bytes| PeerId::try_from_slice(&bytes).ok());
            match (peer, decode_time(&value)) {
                (Some(peer), Some(at)) if now.saturating_sub(at) <= self.validity => {
                    set.set_val(peer, at);
                }
                _ => {
                    debug!("Dropping stale provider entry {}", dskey);
                    self.store.delete(dskey)?;
                }
            }
        }
        Ok(set)
    }

    fn start_gc(&mut self, waiter: Option<oneshot::Sender<()>>) {
        if let Some(gc) = self.gc.as_mut() {
            gc.waiters.extend(waiter);
            return;
        }

        self.cache.clear();
        match self.store.query_prefix(PROVIDERS_PREFIX) {
            Ok(entries) => {
                debug!("Provider GC round started over {} entries", entries.len());
                self.gc = Some(GcRound {
                    pending: entries.into(),
                    skip: HashSet::new(),
                    waiters: waiter.into_iter().collect(),
                });
            }
            Err(e) => {
                warn!("Provider GC snapshot failed: {}", e);
                if let Some(w) = waiter {
                    let _ = w.send(());
                }
            }
        }
    }

    /// Examine one snapshotted entry, or finish the round
    fn gc_step(&mut self) {
        let Some(gc) = self.gc.as_mut() else {
            return;
        };

        match gc.pending.pop_front() {
            Some((dskey, value)) => {
                if gc.skip.contains(&dskey) {
                    return;
                }
                let expired = match decode_time(&value) {
                    Some(at) => self.clock.now_nanos().saturating_sub(at) > self.validity,
                    None => true,
                };
                if expired {
                    if let Err(e) = self.store.delete(dskey) {
                        warn!("Provider GC delete failed: {}", e);
                    }
                }
            }
            None => {
                if let Err(e) = self.store.flush() {
                    warn!("Provider GC flush failed: {}", e);
                }
                if let Some(round) = self.gc.take() {
                    for waiter in round.waiters {
                        let _ = waiter.send(());
                    }
                }
                info!("Provider GC round finished");
            }
        }
    }
}

fn provider_key_prefix(key: &[u8]) -> String {
    format!("{}{}/", PROVIDERS_PREFIX, base32_encode(key))
}

fn provider_key(key: &[u8], peer: &PeerId) -> String {
    format!("{}{}", provider_key_prefix(key), base32_encode(peer.as_bytes()))
}

fn encode_time(nanos: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    prost::encoding::encode_varint(nanos, &mut buf);
    buf
}

fn decode_time(mut buf: &[u8]) -> Option<u64> {
    prost::encoding::decode_varint(&mut buf).ok()
}

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32, upper case, no padding
fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u16 = 0;
    let mut bits = 0;

    for &byte in data {
        buffer = (buffer << 8) | byte as u16;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for c in s.bytes() {
        let val = match c {
            b'A'..=b'Z' => c - b'A',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | val as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Datastore, MemoryDatastore};

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn config() -> ProviderConfig {
        ProviderConfig {
            provide_validity: 24 * HOUR,
            cleanup_interval: 1000 * HOUR,
            cache_size: 16,
            batch_size: 4,
        }
    }

    fn manager() -> (ProviderManager, Arc<MemoryDatastore>, Arc<ManualClock>) {
        let ds = Arc::new(MemoryDatastore::new());
        let clock = Arc::new(ManualClock::new(1_000_000_000));
        let pm = ProviderManager::with_clock(ds.clone(), &config(), clock.clone());
        (pm, ds, clock)
    }

    #[test]
    fn test_base32() {
        assert_eq!(base32_encode(b""), "");
        assert_eq!(base32_encode(b"f"), "MY");
        assert_eq!(base32_encode(b"foobar"), "MZXW6YTBOI");
        assert_eq!(base32_decode("MZXW6YTBOI").unwrap(), b"foobar");
        assert!(base32_decode("mzxw").is_none());
    }

    #[test]
    fn test_provider_key_layout() {
        let peer = PeerId::from_bytes([0u8; 32]);
        let key = provider_key(b"foobar", &peer);
        assert!(key.starts_with("/providers/MZXW6YTBOI/"));
        assert_eq!(decode_time(&encode_time(300)), Some(300));
    }

    #[tokio::test]
    async fn test_add_and_get_providers() {
        let (pm, _ds, _clock) = manager();
        let a = PeerId::random();
        let b = PeerId::random();

        pm.add_provider(b"cid", a).await.unwrap();
        pm.add_provider(b"cid", b).await.unwrap();
        pm.add_provider(b"cid", a).await.unwrap();

        let mut got = pm.get_providers(b"cid").await.unwrap();
        got.sort();
        let mut want = vec![a, b];
        want.sort();
        assert_eq!(got, want);
        assert!(pm.get_providers(b"other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_adds_converge() {
        let (pm, _ds, _clock) = manager();
        let peers: Vec<PeerId> = (0..8).map(|_| PeerId::random()).collect();

        let mut tasks = tokio::task::JoinSet::new();
        for p in peers.clone() {
            let pm = pm.clone();
            tasks.spawn(async move { pm.add_provider(b"cid", p).await });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }

        let got = pm.get_providers(b"cid").await.unwrap();
        assert_eq!(got.len(), peers.len());
        for p in &peers {
            assert!(got.contains(p));
        }
    }

    #[tokio::test]
    async fn test_providers_expire_after_validity() {
        let (pm, ds, clock) = manager();
        let peer = PeerId::random();

        pm.add_provider(b"cid", peer).await.unwrap();
        assert_eq!(pm.get_providers(b"cid").await.unwrap(), vec![peer]);

        clock.advance(25 * HOUR);
        pm.run_gc().await.unwrap();

        assert!(pm.get_providers(b"cid").await.unwrap().is_empty());
        assert!(ds.query_prefix(PROVIDERS_PREFIX).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_entries_survive_gc() {
        let (pm, ds, clock) = manager();
        let peer = PeerId::random();

        pm.add_provider(b"cid", peer).await.unwrap();
        clock.advance(HOUR);
        pm.run_gc().await.unwrap();

        assert_eq!(pm.get_providers(b"cid").await.unwrap(), vec![peer]);
        assert_eq!(ds.query_prefix(PROVIDERS_PREFIX).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_dropped_on_load() {
        let ds = Arc::new(MemoryDatastore::new());
        let clock = Arc::new(ManualClock::new(0));
        let peer = PeerId::random();
        ds.put(&provider_key(b"cid", &peer), encode_time(0)).unwrap();
        ds.put(&format!("{}garbage", provider_key_prefix(b"cid")), encode_time(0)).unwrap();

        clock.advance(48 * HOUR);
        let pm = ProviderManager::with_clock(ds.clone(), &config(), clock);
        assert!(pm.get_providers(b"cid").await.unwrap().is_empty());
        pm.close().await;

        // Deletes are flushed when the manager stops
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ds.query_prefix(PROVIDERS_PREFIX).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gc_skips_entries_rewritten_mid_round() {
        let (pm, ds, clock) = manager();
        let peer = PeerId::random();

        pm.add_provider(b"cid", peer).await.unwrap();
        clock.advance(25 * HOUR);

        // The re-announce lands after the round has snapshotted the old entry
        let (gc, add) = tokio::join!(pm.run_gc(), pm.add_provider(b"cid", peer));
        gc.unwrap();
        add.unwrap();

        assert_eq!(pm.get_providers(b"cid").await.unwrap(), vec![peer]);
        assert_eq!(ds.query_prefix(PROVIDERS_PREFIX).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_manager_reports_closed() {
        let (pm, _ds, _clock) = manager();
        pm.close().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(pm.get_providers(b"cid").await, Err(DhtError::Closed)));
    }
}
