//! Protocol buffer message definitions for the DHT wire protocol
//!
//! These are manually defined to match the keepnet dht.proto schema,
//! avoiding the need for protoc at build time.

use crate::{unix_nanos, Connectedness, Error, PeerId, PeerInfo, Result};
use prost::Message as _;

/// Discriminates what a [`Message`] asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    PutValue = 0,
    GetValue = 1,
    AddProvider = 2,
    GetProviders = 3,
    FindNode = 4,
    Ping = 5,
    MetaInfo = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionType {
    NotConnected = 0,
    Connected = 1,
    CanConnect = 2,
    CannotConnect = 3,
}

/// Whether a request targets a single peer or is being broadcast
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum OpType {
    Unary = 0,
    BroadCast = 1,
}

/// One DHT RPC unit, used for both requests and responses
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(bytes, tag = "2")]
    pub key: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub record: Option<Record>,
    #[prost(message, repeated, tag = "8")]
    pub closer_peers: Vec<Peer>,
    #[prost(message, repeated, tag = "9")]
    pub provider_peers: Vec<Peer>,
    #[prost(enumeration = "OpType", tag = "11")]
    pub op_type: i32,
    /// Name of the application operation carried by a META_INFO message
    #[prost(string, tag = "12")]
    pub caller: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Record {
    #[prost(bytes, tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes, tag = "2")]
    pub value: Vec<u8>,
    /// Unix nanoseconds at which the local peer received the record
    #[prost(uint64, tag = "5")]
    pub time_received: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Peer {
    #[prost(bytes, tag = "1")]
    pub id: Vec<u8>,
    #[prost(string, repeated, tag = "2")]
    pub addrs: Vec<String>,
    #[prost(enumeration = "ConnectionType", tag = "3")]
    pub connection: i32,
}

impl Message {
    pub fn new(kind: MessageType, key: impl Into<Vec<u8>>) -> Self {
        Self {
            r#type: kind as i32,
            key: key.into(),
            ..Default::default()
        }
    }

    /// The message type, rejecting values this build does not know
    pub fn kind(&self) -> Result<MessageType> {
        MessageType::try_from(self.r#type)
            .map_err(|_| Error::Protocol(format!("unknown message type {}", self.r#type)))
    }

    /// Operation scope; unknown values read as unary
    pub fn op(&self) -> OpType {
        OpType::try_from(self.op_type).unwrap_or(OpType::Unary)
    }

    pub fn with_op(mut self, op: OpType) -> Self {
        self.op_type = op as i32;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(Self::decode(buf)?)
    }

    /// Closer peers carried by the message, skipping entries with malformed ids
    pub fn closer_peer_infos(&self) -> Vec<PeerInfo> {
        peers_to_infos(&self.closer_peers)
    }

    pub fn provider_peer_infos(&self) -> Vec<PeerInfo> {
        peers_to_infos(&self.provider_peers)
    }
}

impl Record {
    /// Create a record stamped with the current time
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            time_received: unix_nanos(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(Self::decode(buf)?)
    }
}

impl Peer {
    pub fn from_info(info: &PeerInfo, connectedness: Connectedness) -> Self {
        let connection = match connectedness {
            Connectedness::NotConnected => ConnectionType::NotConnected,
            Connectedness::Connected => ConnectionType::Connected,
            Connectedness::CanConnect => ConnectionType::CanConnect,
            Connectedness::CannotConnect => ConnectionType::CannotConnect,
        };
        Self {
            id: info.id.to_vec(),
            addrs: info.addrs.clone(),
            connection: connection as i32,
        }
    }

    pub fn to_info(&self) -> Result<PeerInfo> {
        Ok(PeerInfo::new(PeerId::try_from_slice(&self.id)?, self.addrs.clone()))
    }
}

fn peers_to_infos(peers: &[Peer]) -> Vec<PeerInfo> {
    peers
        .iter()
        .filter_map(|p| match p.to_info() {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!("dropping peer entry: {}", e);
                None
            }
        })
        .collect()
}
