//! Kademlia routing table implementation

use bitvec::prelude::*;
use keepnet_core::{KadId, PeerId};
use std::collections::VecDeque;
use std::time::Instant;

/// One bucket per bit of the 256-bit key space
pub const NUM_BUCKETS: usize = 256;

/// Find the index of the most significant bit that differs
pub fn bucket_index(distance: &KadId) -> usize {
    msb_index(distance.as_bytes())
}

fn msb_index(bytes: &[u8; 32]) -> usize {
    match bytes.view_bits::<Msb0>().first_one() {
        Some(leading_zeros) => NUM_BUCKETS - 1 - leading_zeros,
        None => 0,
    }
}

/// A peer known to the routing table
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer: PeerId,
    pub kad_id: KadId,
    pub last_seen: Instant,
}

/// A k-bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Maximum number of peers in this bucket
    k: usize,
    /// Peers in this bucket, ordered by last seen (most recent at back)
    peers: VecDeque<PeerEntry>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            peers: VecDeque::with_capacity(k),
        }
    }

    /// Add or update a peer in the bucket
    /// Returns true if the peer was added/updated, false if bucket is full
    pub fn upsert(&mut self, entry: PeerEntry) -> bool {
        if let Some(pos) = self.peers.iter().position(|e| e.peer == entry.peer) {
            // Move to back (most recently seen)
            self.peers.remove(pos);
            self.peers.push_back(entry);
            return true;
        }

        if self.peers.len() < self.k {
            self.peers.push_back(entry);
            return true;
        }

        false
    }

    pub fn remove(&mut self, peer: &PeerId) -> bool {
        match self.peers.iter().position(|e| e.peer == *peer) {
            Some(pos) => {
                self.peers.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.k
    }
}

/// Kademlia routing table
pub struct RoutingTable {
    local: PeerId,
    local_kad: KadId,
    /// K-buckets (256 buckets for 256-bit ids)
    buckets: Vec<KBucket>,
    k: usize,
}

impl RoutingTable {
    pub fn new(local: PeerId, k: usize) -> Self {
        Self {
            local,
            local_kad: KadId::from_peer(&local),
            buckets: (0..NUM_BUCKETS).map(|_| KBucket::new(k)).collect(),
            k,
        }
    }

    /// Record contact with a peer; the local peer is never admitted
    pub fn update(&mut self, peer: PeerId) -> bool {
        if peer == self.local {
            return false;
        }
        let kad_id = KadId::from_peer(&peer);
        let idx = bucket_index(&self.local_kad.distance(&kad_id));
        self.buckets[idx].upsert(PeerEntry {
            peer,
            kad_id,
            last_seen: Instant::now(),
        })
    }

    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let idx = bucket_index(&self.local_kad.distance(&KadId::from_peer(peer)));
        self.buckets[idx].remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        let idx = bucket_index(&self.local_kad.distance(&KadId::from_peer(peer)));
        self.buckets[idx].entries().any(|e| e.peer == *peer)
    }

    /// Find the `count` closest peers to a target
    pub fn nearest_peers(&self, target: &KadId, count: usize) -> Vec<PeerId> {
        let mut all: Vec<&PeerEntry> = self.buckets.iter().flat_map(|b| b.entries()).collect();
        all.sort_by_key(|e| e.kad_id.distance(target));
        all.into_iter().take(count).map(|e| e.peer).collect()
    }

    pub fn list_peers(&self) -> Vec<PeerId> {
        self.buckets.iter().flat_map(|b| b.entries()).map(|e| e.peer).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    pub fn bucket_size(&self) -> usize {
        self.k
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        let mut dist = [0u8; 32];
        dist[31] = 1;
        assert_eq!(msb_index(&dist), 0);

        dist[31] = 0x80;
        assert_eq!(msb_index(&dist), 7);

        dist[0] = 0x80;
        dist[31] = 0;
        assert_eq!(msb_index(&dist), 255);

        assert_eq!(bucket_index(&KadId::from_key(b"x").distance(&KadId::from_key(b"x"))), 0);
    }

    #[test]
    fn test_local_peer_never_admitted() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, 20);

        assert!(!table.update(local));
        for _ in 0..50 {
            table.update(PeerId::random());
            table.update(local);
        }
        assert!(!table.contains(&local));
        assert!(!table.list_peers().contains(&local));
        assert_eq!(table.len(), table.list_peers().len());
    }

    #[test]
    fn test_full_bucket_rejects_new_peer() {
        let local = PeerId::random();
        let local_kad = KadId::from_peer(&local);
        let mut table = RoutingTable::new(local, 2);

        // Collect three peers landing in the farthest bucket
        let mut far = Vec::new();
        while far.len() < 3 {
            let p = PeerId::random();
            if bucket_index(&local_kad.distance(&KadId::from_peer(&p))) == NUM_BUCKETS - 1 {
                far.push(p);
            }
        }

        assert!(table.update(far[0]));
        assert!(table.update(far[1]));
        assert!(!table.update(far[2]));
        // Refreshing a known peer still succeeds
        assert!(table.update(far[0]));
    }

    #[test]
    fn test_nearest_peers_sorted_by_distance() {
        let mut table = RoutingTable::new(PeerId::random(), 20);
        let peers: Vec<PeerId> = (0..30).map(|_| PeerId::random()).collect();
        for p in &peers {
            table.update(*p);
        }

        let target = KadId::from_key(b"some key");
        let nearest = table.nearest_peers(&target, 5);

        let mut reference = table.list_peers();
        reference.sort_by_key(|p| KadId::from_peer(p).distance(&target));
        reference.truncate(5);
        assert_eq!(nearest, reference);
    }

    #[test]
    fn test_remove() {
        let mut table = RoutingTable::new(PeerId::random(), 20);
        let p = PeerId::random();
        table.update(p);
        assert!(table.contains(&p));
        assert!(table.remove(&p));
        assert!(!table.contains(&p));
        assert!(table.is_empty());
    }
}
