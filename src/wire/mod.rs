//! The peer wire protocol: the handshake and the length-prefixed message
//! stream that follows it.
use thiserror::Error;

pub mod handshake;
pub mod message;

pub use handshake::Handshake;
pub use message::Message;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid protocol length: {0}")]
    InvalidProtocolLength(u8),

    #[error("invalid protocol identifier: {0:?}")]
    InvalidProtocolIdentifier(Vec<u8>),

    #[error("info hash mismatch: expected {expected:?}, got {got:?}")]
    InfoHashMismatch { expected: [u8; 20], got: [u8; 20] },

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("malformed message body for id {id}: {reason}")]
    MalformedMessage { id: u8, reason: String },
}

pub type WireResult<T> = std::result::Result<T, WireError>;
