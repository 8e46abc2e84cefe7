//! keepnet Core - Shared identifiers, wire messages, and transports
//!
//! This crate provides the building blocks the keepnet DHT and node are
//! assembled from: peer identifiers and the Kademlia key space, the
//! protobuf message exchanged between peers, and the host abstraction
//! that carries those messages.

pub mod error;
pub mod proto;
pub mod tcp;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use tcp::TcpHost;
pub use transport::{FrameKind, Host, HostHandle, MessageStream, StreamHandler};
pub use types::*;

/// Default protocol identifier spoken by keepnet DHT peers
pub const DEFAULT_PROTOCOL: &str = "/keepnet/kad/1.0.0";
