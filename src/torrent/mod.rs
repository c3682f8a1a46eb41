//! Torrent state: metainfo loading, the piece state machine, and the piece
//! scheduling/bookkeeping engine.
use thiserror::Error;

pub mod engine;
pub mod metainfo;
pub mod piece;

pub use engine::Torrent;
pub use metainfo::Metainfo;
pub use piece::{Piece, PieceState};

/// Errors surfaced by the torrent engine and its metainfo loader.
///
/// A failed piece-hash verification is deliberately not represented here: it
/// is handled locally (the piece resets to `EMPTY`) and never surfaced as an
/// `Err`.
#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file: {0}")]
    InvalidTorrent(String),

    #[error("piece index {0} out of range")]
    PieceIndexOutOfRange(usize),

    #[error("wrote to piece {0} while not EMPTY")]
    WrongPieceState(usize),
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
