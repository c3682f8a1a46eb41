//! Remote peers: identity, choke/interest bookkeeping, and the connection
//! driver that turns inbound wire messages into engine calls.
use thiserror::Error;

pub mod connection;

pub use connection::{Connection, ConnectionState};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("wire protocol error: {0}")]
    Wire(#[from] crate::wire::WireError),

    #[error("torrent engine error: {0}")]
    Torrent(#[from] crate::torrent::TorrentError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection timed out waiting for keep-alive")]
    Timeout,

    #[error("peer sent a message before completing the handshake")]
    MessageBeforeHandshake,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

/// The four choke/interest booleans both sides of a connection track, named
/// from our own point of view: `am_choking`, `am_interested`,
/// `peer_choking`, `peer_interested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterestState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for InterestState {
    fn default() -> Self {
        InterestState { am_choking: true, am_interested: false, peer_choking: true, peer_interested: false }
    }
}
