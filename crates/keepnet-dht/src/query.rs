//! Iterative lookups
//!
//! A lookup starts from the K closest peers in the routing table and
//! queries alpha of them at a time, folding the closer peers each reply
//! carries back into the shortlist, until the K closest known peers have
//! all answered or failed.

use crate::dht::KadDht;
use crate::{DhtError, Result};
use keepnet_core::{KadId, PeerId, PeerInfo};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use tokio::task::JoinSet;
use tracing::debug;

/// What one peer contributed to a lookup
pub(crate) struct PeerQueryResult {
    pub closer_peers: Vec<PeerInfo>,
    /// Stop the lookup after this round
    pub done: bool,
}

impl PeerQueryResult {
    pub fn closer(closer_peers: Vec<PeerInfo>) -> Self {
        Self {
            closer_peers,
            done: false,
        }
    }

    pub fn done() -> Self {
        Self {
            closer_peers: Vec::new(),
            done: true,
        }
    }
}

pub(crate) struct LookupOutcome {
    /// Peers that answered, closest first, at most K
    pub closest: Vec<PeerId>,
    /// Whether a query asked for the lookup to stop early
    pub done: bool,
    pub queried: usize,
    pub failed: usize,
    pub last_error: Option<DhtError>,
}

impl LookupOutcome {
    /// The lookup's failure when no queried peer answered at all
    pub fn failure(self) -> Option<DhtError> {
        if !self.closest.is_empty() {
            return None;
        }
        let failed = self.failed;
        self.last_error.map(|last| DhtError::Aggregate {
            failed,
            last: Box::new(last),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupScope {
    /// Walk towards the target through closer peers
    Nearest,
    /// Ask the nearest known peers only, without following referrals
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Waiting,
    Queried,
    Failed,
}

pub(crate) async fn run_lookup<F, Fut>(
    dht: &KadDht,
    target: &[u8],
    scope: LookupScope,
    query_fn: F,
) -> Result<LookupOutcome>
where
    F: Fn(PeerId) -> Fut,
    Fut: Future<Output = Result<PeerQueryResult>> + Send + 'static,
{
    let k = dht.config().k;
    let alpha = dht.config().alpha;
    let target_kad = KadId::from_key(target);
    let self_id = dht.self_id();

    let seeds = dht.nearest_peers(&target_kad, k);
    if seeds.is_empty() {
        return Err(DhtError::NoPeersInTable);
    }

    // Keyed by distance so iteration order is closest first
    let mut shortlist: BTreeMap<KadId, (PeerId, PeerState)> = BTreeMap::new();
    let mut seen: HashSet<PeerId> = HashSet::new();
    for peer in seeds {
        seen.insert(peer);
        shortlist.insert(KadId::from_peer(&peer).distance(&target_kad), (peer, PeerState::Waiting));
    }

    let mut outcome = LookupOutcome {
        closest: Vec::new(),
        done: false,
        queried: 0,
        failed: 0,
        last_error: None,
    };

    loop {
        let batch: Vec<(KadId, PeerId)> = shortlist
            .iter()
            .filter(|(_, (_, state))| *state != PeerState::Failed)
            .take(k)
            .filter(|(_, (_, state))| *state == PeerState::Waiting)
            .take(alpha)
            .map(|(dist, (peer, _))| (*dist, *peer))
            .collect();
        if batch.is_empty() {
            break;
        }

        let mut tasks = JoinSet::new();
        for (dist, peer) in batch {
            let fut = query_fn(peer);
            tasks.spawn(async move { (dist, peer, fut.await) });
        }

        while let Some(joined) = tasks.join_next().await {
            let (dist, peer, result) = match joined {
                Ok(v) => v,
                Err(e) => {
                    debug!("Lookup task failed: {}", e);
                    continue;
                }
            };
            outcome.queried += 1;

            match result {
                Ok(res) => {
                    if let Some(entry) = shortlist.get_mut(&dist) {
                        entry.1 = PeerState::Queried;
                    }
                    outcome.done |= res.done;
                    for info in res.closer_peers {
                        if info.id == self_id {
                            continue;
                        }
                        dht.host().add_peer_addrs(&info.id, &info.addrs);
                        if scope == LookupScope::Nearest && seen.insert(info.id) {
                            shortlist.insert(
                                KadId::from_peer(&info.id).distance(&target_kad),
                                (info.id, PeerState::Waiting),
                            );
                        }
                    }
                }
                Err(e) => {
                    debug!("Lookup query to {} failed: {}", peer.short(), e);
                    if let Some(entry) = shortlist.get_mut(&dist) {
                        entry.1 = PeerState::Failed;
                    }
                    outcome.failed += 1;
                    outcome.last_error = Some(e);
                }
            }
        }

        if outcome.done {
            break;
        }
    }

    outcome.closest = shortlist
        .values()
        .filter(|(_, state)| *state == PeerState::Queried)
        .take(k)
        .map(|(peer, _)| *peer)
        .collect();
    Ok(outcome)
}
