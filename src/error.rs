//! Crate-level error type unifying every subsystem's error enum for the
//! binary's top-level `Result`.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error(transparent)]
    Torrent(#[from] crate::torrent::TorrentError),

    #[error(transparent)]
    Wire(#[from] crate::wire::WireError),

    #[error(transparent)]
    Peer(#[from] crate::peer::PeerError),

    #[error(transparent)]
    Tracker(#[from] crate::tracker::TrackerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
