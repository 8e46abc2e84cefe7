//! Error types for keepnet core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Peer {peer} does not support any of {protocols:?}")]
    ProtocolNotSupported { peer: String, protocols: Vec<String> },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Stream reset: {0}")]
    StreamReset(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, Error>;
