//! Core identifier types for keepnet

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Length of a peer identifier in bytes
pub const PEER_ID_LEN: usize = 32;

/// An opaque 32-byte peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a peer id from a wire buffer
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PEER_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidPeerId(format!("expected {} bytes, got {}", PEER_ID_LEN, bytes.len()))
        })?;
        Ok(Self(arr))
    }

    /// Generate a random peer id
    ///
    /// Falls back to hashing the clock and a process-wide counter if the OS
    /// random source is unavailable.
    pub fn random() -> Self {
        static FALLBACK: AtomicU64 = AtomicU64::new(0);

        let mut bytes = [0u8; PEER_ID_LEN];
        if getrandom::getrandom(&mut bytes).is_err() {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&unix_nanos().to_le_bytes());
            hasher.update(&FALLBACK.fetch_add(1, Ordering::SeqCst).to_le_bytes());
            bytes = *hasher.finalize().as_bytes();
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated hex form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidPeerId(e.to_string()))?;
        Self::try_from_slice(&bytes)
    }
}

/// A position in the Kademlia key space.
///
/// Peers and keys are both mapped into the space by hashing, so distances
/// between a peer and a record key are comparable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct KadId([u8; 32]);

impl KadId {
    pub fn from_key(key: &[u8]) -> Self {
        Self(*blake3::hash(key).as_bytes())
    }

    pub fn from_peer(peer: &PeerId) -> Self {
        Self::from_key(peer.as_bytes())
    }

    /// XOR distance; compares big-endian, so `Ord` on the result orders by closeness
    pub fn distance(&self, other: &KadId) -> KadId {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        KadId(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Connection state of a remote peer as seen by the local host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectedness {
    NotConnected,
    Connected,
    CanConnect,
    CannotConnect,
}

/// A peer together with the addresses it can be dialed on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }
}

/// Current wall-clock time in nanoseconds since the unix epoch
pub fn unix_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
