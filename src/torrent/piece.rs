//! A single piece's buffer and state machine.
//!
//! Transitions only ever run forward `EMPTY -> FULL -> VERIFIED -> SAVED`,
//! or backward to `EMPTY` when a hash check fails. This state machine is
//! what prevents a partially hashed piece from being written to disk and
//! prevents a corrupted piece from poisoning file regions it shares with
//! neighbors.
use crate::torrent::{TorrentError, TorrentResult};
use sha1::{Digest, Sha1};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Empty,
    Full,
    Verified,
    Saved,
}

/// One piece's buffer, hash, and lifecycle state.
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: usize,
    pub expected_hash: [u8; 20],
    pub length: usize,
    buffer: Vec<u8>,
    state: PieceState,
}

impl Piece {
    pub fn new(index: usize, expected_hash: [u8; 20], length: usize) -> Self {
        Piece { index, expected_hash, length, buffer: Vec::new(), state: PieceState::Empty }
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Writes `data` at `offset` into the piece buffer. Only legal while
    /// `EMPTY`; overlapping writes are allowed and idempotent (last writer
    /// for any given byte wins). Transitions to `FULL` once the buffer has
    /// grown to `length` bytes.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> TorrentResult<()> {
        if self.state != PieceState::Empty {
            return Err(TorrentError::WrongPieceState(self.index));
        }

        let end = offset + data.len();
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[offset..end].copy_from_slice(data);

        if self.buffer.len() == self.length {
            self.state = PieceState::Full;
        }
        Ok(())
    }

    /// Hashes the buffer against `expected_hash`. On success transitions to
    /// `VERIFIED` and returns `true`. On mismatch the buffer is dropped and
    /// the piece resets to `EMPTY` so it can be re-requested wholesale; this
    /// never surfaces as an `Err`.
    pub fn verify(&mut self) -> TorrentResult<bool> {
        if self.state != PieceState::Full {
            return Err(TorrentError::WrongPieceState(self.index));
        }

        if Sha1::digest(&self.buffer).as_slice() == self.expected_hash {
            self.state = PieceState::Verified;
            Ok(true)
        } else {
            self.buffer = Vec::new();
            self.state = PieceState::Empty;
            Ok(false)
        }
    }

    /// Opens `path`, seeks to `byte_offset`, writes the buffer, and releases
    /// it. Only legal while `VERIFIED`. On I/O failure the piece remains
    /// `VERIFIED` so the caller can retry the save later.
    pub fn save(&mut self, path: &Path, byte_offset: u64) -> TorrentResult<()> {
        if self.state != PieceState::Verified {
            return Err(TorrentError::WrongPieceState(self.index));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create(true).open(path)?;
        file.seek(SeekFrom::Start(byte_offset))?;
        file.write_all(&self.buffer)?;

        self.buffer = Vec::new();
        self.state = PieceState::Saved;
        Ok(())
    }

    /// Marks the piece `SAVED` and releases its buffer without writing
    /// anything, for callers that already wrote the buffer's bytes
    /// themselves (the engine's multi-file region writer splits a single
    /// piece's buffer across several files, which `save` cannot express).
    pub fn mark_saved(&mut self) {
        if self.state == PieceState::Verified {
            self.buffer = Vec::new();
            self.state = PieceState::Saved;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn hash_of(data: &[u8]) -> [u8; 20] {
        Sha1::digest(data).into()
    }

    #[test]
    fn lifecycle_happy_path() {
        let data = b"0123456789abcdef";
        let mut piece = Piece::new(0, hash_of(data), data.len());
        assert_eq!(piece.state(), PieceState::Empty);

        piece.write(0, &data[0..8]).unwrap();
        assert_eq!(piece.state(), PieceState::Empty);
        piece.write(8, &data[8..16]).unwrap();
        assert_eq!(piece.state(), PieceState::Full);

        assert!(piece.verify().unwrap());
        assert_eq!(piece.state(), PieceState::Verified);

        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        piece.save(&path, 0).unwrap();
        assert_eq!(piece.state(), PieceState::Saved);

        let written = std::fs::read(&path).unwrap();
        assert_eq!(&written[..16], data);
    }

    #[test]
    fn mismatched_hash_resets_to_empty() {
        let mut piece = Piece::new(1, [0u8; 20], 4);
        piece.write(0, b"boom").unwrap();
        assert_eq!(piece.state(), PieceState::Full);

        assert!(!piece.verify().unwrap());
        assert_eq!(piece.state(), PieceState::Empty);
        assert!(piece.buffer().is_empty());
    }

    #[test]
    fn overlapping_writes_are_idempotent_last_writer_wins() {
        let mut piece = Piece::new(0, [0u8; 20], 4);
        piece.write(0, b"AAAA").unwrap();
        piece.write(2, b"BB").unwrap();
        assert_eq!(piece.buffer(), b"AABB");
    }

    #[test]
    fn write_rejected_once_full() {
        let mut piece = Piece::new(0, [0u8; 20], 4);
        piece.write(0, b"AAAA").unwrap();
        assert!(piece.write(0, b"Z").is_err());
    }

    #[test]
    fn verify_rejected_before_full() {
        let mut piece = Piece::new(0, [0u8; 20], 4);
        assert!(piece.verify().is_err());
    }
}
