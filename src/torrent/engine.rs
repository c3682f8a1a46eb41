//! The per-torrent engine: piece claiming, rarest-first selection, and
//! the file-region writer.
//!
//! Grounded on `Torrent`/`calculate_rarity`/`ask_for_block`/`recieve_block`
//! from the Python bridge this crate descends from, restructured around a
//! parallel thread-per-task model with shared state: a single `Torrent` is
//! wrapped in `Arc<tokio::sync::Mutex<Torrent>>` by callers and `claim_piece`
//! is the one atomic section that enforces the at-most-one-holder invariant.
use crate::torrent::metainfo::Metainfo;
use crate::torrent::piece::{Piece, PieceState};
use crate::torrent::{TorrentError, TorrentResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, instrument};

pub const BLOCK_REQUEST_SIZE: u32 = 1 << 15;

/// A block-sized slice of a piece still owed by some peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece_index: usize,
    pub offset: u32,
    pub length: u32,
}

/// A fully downloaded block, resolved against the file table for a single
/// disk write. If the piece straddles a file boundary the resolver yields
/// one region per file the write touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRegion {
    pub path: PathBuf,
    pub file_offset: u64,
    pub piece_offset: usize,
    pub length: usize,
}

/// Per-peer download bookkeeping the engine needs for rarest-first
/// selection: which pieces it has, and whether we're currently choked.
#[derive(Debug, Clone)]
pub struct PeerView {
    pub addr: SocketAddr,
    pub piecefield: Vec<bool>,
    pub peer_choking: bool,
}

/// The live state of one torrent: its immutable metainfo, mutable piece
/// table, and the peers known to have parts of it.
pub struct Torrent {
    pub metainfo: Metainfo,
    pub download_dir: PathBuf,
    pieces: Vec<Piece>,
    /// Pieces currently claimed by a connection, mapped to the peer
    /// address holding the claim. A piece may have at most one holder.
    claims: HashMap<usize, SocketAddr>,
    peers: Vec<PeerView>,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
}

impl Torrent {
    pub fn new(metainfo: Metainfo, download_dir: PathBuf) -> Self {
        let pieces = metainfo
            .pieces
            .iter()
            .enumerate()
            .map(|(index, hash)| Piece::new(index, *hash, metainfo.piece_length_at(index) as usize))
            .collect();

        Torrent {
            metainfo,
            download_dir,
            pieces,
            claims: HashMap::new(),
            peers: Vec::new(),
            total_downloaded: 0,
            total_uploaded: 0,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_state(&self, index: usize) -> Option<PieceState> {
        self.pieces.get(index).map(Piece::state)
    }

    /// The local bitfield: one bit per piece, set once that piece has been
    /// verified (not necessarily saved yet — a peer only needs to know we
    /// can serve it).
    pub fn local_bitfield(&self) -> Vec<bool> {
        self.pieces
            .iter()
            .map(|p| matches!(p.state(), PieceState::Verified | PieceState::Saved))
            .collect()
    }

    pub fn bytes_completed(&self) -> u64 {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p.state(), PieceState::Verified | PieceState::Saved))
            .map(|(i, _)| self.metainfo.piece_length_at(i))
            .sum()
    }

    /// Bytes still needed to complete the torrent, per the tracker's `left`
    /// announce parameter.
    pub fn left(&self) -> u64 {
        self.metainfo.total_size() - self.bytes_completed()
    }

    pub fn percent_complete(&self) -> f64 {
        let total = self.metainfo.total_size();
        if total == 0 {
            return 100.0;
        }
        (self.bytes_completed() as f64 / total as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| matches!(p.state(), PieceState::Verified | PieceState::Saved))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn insert_peer(&mut self, peer: PeerView) {
        if let Some(existing) = self.peers.iter_mut().find(|p| p.addr == peer.addr) {
            *existing = peer;
        } else {
            self.peers.push(peer);
        }
    }

    pub fn remove_peer(&mut self, addr: SocketAddr) {
        self.peers.retain(|p| p.addr != addr);
        self.claims.retain(|_, holder| *holder != addr);
    }

    pub fn update_peer_piece(&mut self, addr: SocketAddr, piece_index: usize, have: bool) {
        if let Some(peer) = self.peers.iter_mut().find(|p| p.addr == addr) {
            if piece_index < peer.piecefield.len() {
                peer.piecefield[piece_index] = have;
            }
        }
    }

    /// Orders not-yet-verified pieces by ascending availability across the
    /// known swarm (rarest first). Pieces with zero holders sort last —
    /// nobody can serve them yet, so there is no point prioritizing them.
    pub fn rarest_first_order(&self) -> Vec<usize> {
        let mut counts: Vec<(usize, usize)> = (0..self.pieces.len())
            .filter(|&i| !matches!(self.pieces[i].state(), PieceState::Verified | PieceState::Saved))
            .map(|i| {
                let rarity = self.peers.iter().filter(|p| p.piecefield.get(i).copied().unwrap_or(false)).count();
                (i, rarity)
            })
            .collect();

        counts.sort_by(|a, b| {
            let a_key = if a.1 == 0 { usize::MAX } else { a.1 };
            let b_key = if b.1 == 0 { usize::MAX } else { b.1 };
            a_key.cmp(&b_key).then(a.0.cmp(&b.0))
        });

        counts.into_iter().map(|(i, _)| i).collect()
    }

    /// Claims the piece `addr` should request next. If `addr` already
    /// holds a claim, that same piece is returned so an in-progress piece
    /// is always finished before a new one is started. Otherwise picks a
    /// piece that peer already has, that nobody else
    /// currently holds, and that isn't already verified. Returns `None`
    /// when there is nothing left this peer can contribute. This is the
    /// single atomic section that enforces "at most one holder per piece"
    /// — callers must serialize through one lock around the owning
    /// `Torrent`.
    #[instrument(skip(self), fields(peer = %addr))]
    pub fn claim_piece(&mut self, addr: SocketAddr) -> Option<usize> {
        if let Some((&index, _)) = self.claims.iter().find(|(_, &holder)| holder == addr) {
            return Some(index);
        }

        let peer = self.peers.iter().find(|p| p.addr == addr)?;
        let piecefield = peer.piecefield.clone();

        for index in self.rarest_first_order() {
            if piecefield.get(index).copied().unwrap_or(false) && !self.claims.contains_key(&index) {
                self.claims.insert(index, addr);
                debug!(piece = index, "claimed");
                return Some(index);
            }
        }
        None
    }

    pub fn release_claim(&mut self, index: usize) {
        self.claims.remove(&index);
    }

    pub fn claim_holder(&self, index: usize) -> Option<SocketAddr> {
        self.claims.get(&index).copied()
    }

    /// Builds the next block request for a piece this connection already
    /// holds: resumes at the current buffer length, same as the upstream
    /// `ask_for_block` behavior of always requesting the next unfilled
    /// offset within the claimed piece.
    pub fn next_block_request(&self, index: usize) -> TorrentResult<Option<BlockRequest>> {
        let piece = self.pieces.get(index).ok_or(TorrentError::PieceIndexOutOfRange(index))?;
        if piece.state() != PieceState::Empty {
            return Ok(None);
        }
        let offset = piece.buffer().len() as u32;
        let remaining = piece.length as u32 - offset;
        if remaining == 0 {
            return Ok(None);
        }
        let length = remaining.min(BLOCK_REQUEST_SIZE);
        Ok(Some(BlockRequest { piece_index: index, offset, length }))
    }

    /// Feeds a downloaded block into its piece. Once the piece fills,
    /// verifies it; on success resolves the file regions it spans and
    /// releases the claim either way (so a failed piece becomes available
    /// for re-claim on the next rarest-first pass).
    #[instrument(skip(self, data), fields(piece = piece_index, len = data.len()))]
    pub fn receive_block(&mut self, piece_index: usize, offset: u32, data: &[u8]) -> TorrentResult<ReceiveOutcome> {
        let piece = self.pieces.get_mut(piece_index).ok_or(TorrentError::PieceIndexOutOfRange(piece_index))?;
        piece.write(offset as usize, data)?;
        self.total_downloaded += data.len() as u64;

        if piece.state() != PieceState::Full {
            return Ok(ReceiveOutcome::InProgress);
        }

        if self.pieces[piece_index].verify()? {
            let regions = self.file_regions_for_piece(piece_index);
            self.release_claim(piece_index);
            Ok(ReceiveOutcome::Verified(regions))
        } else {
            self.release_claim(piece_index);
            Ok(ReceiveOutcome::HashMismatch)
        }
    }

    /// Writes a verified piece's buffer to disk across every file region it
    /// spans, then marks it saved.
    pub fn save_piece(&mut self, piece_index: usize) -> TorrentResult<()> {
        let regions = self.file_regions_for_piece(piece_index);
        let piece = self.pieces.get_mut(piece_index).ok_or(TorrentError::PieceIndexOutOfRange(piece_index))?;
        let buffer = piece.buffer().to_vec();

        let mut consumed = 0usize;
        for region in &regions {
            let path = self.download_dir.join(&region.path);
            let slice = &buffer[consumed..consumed + region.length];
            write_region(&path, region.file_offset, slice)?;
            consumed += region.length;
        }
        piece.mark_saved();
        Ok(())
    }

    /// Splits piece `index`'s byte range across every file it overlaps.
    /// A piece straddles two files whenever the boundary between them
    /// falls strictly inside the piece's byte range.
    fn file_regions_for_piece(&self, index: usize) -> Vec<FileRegion> {
        let piece_len = self.metainfo.piece_length;
        let piece_start = index as u64 * piece_len;
        let piece_end = piece_start + self.metainfo.piece_length_at(index);

        let mut regions = Vec::new();
        let mut file_start = 0u64;
        for file in &self.metainfo.files {
            let file_end = file_start + file.size_bytes;
            let overlap_start = piece_start.max(file_start);
            let overlap_end = piece_end.min(file_end);

            if overlap_start < overlap_end {
                regions.push(FileRegion {
                    path: file.relative_path.clone(),
                    file_offset: overlap_start - file_start,
                    piece_offset: (overlap_start - piece_start) as usize,
                    length: (overlap_end - overlap_start) as usize,
                });
            }
            file_start = file_end;
        }
        regions
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    InProgress,
    Verified(Vec<FileRegion>),
    HashMismatch,
}

fn write_region(path: &std::path::Path, offset: u64, data: &[u8]) -> TorrentResult<()> {
    use std::io::{Seek, SeekFrom, Write};
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new().write(true).create(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::FileEntry;

    fn meta_two_pieces() -> Metainfo {
        Metainfo {
            info_hash: [0u8; 20],
            piece_length: 16,
            pieces: vec![[1u8; 20], [2u8; 20]],
            files: vec![FileEntry { relative_path: PathBuf::from("data.bin"), size_bytes: 24, first_piece_index: 0 }],
            announce_tiers: vec![vec!["http://tracker.test".into()]],
            name: "data.bin".into(),
            comment: None,
            created_by: None,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn rarest_first_prefers_least_available_piece() {
        let mut torrent = Torrent::new(meta_two_pieces(), PathBuf::from("/tmp"));
        torrent.insert_peer(PeerView { addr: addr(1), piecefield: vec![true, true], peer_choking: false });
        torrent.insert_peer(PeerView { addr: addr(2), piecefield: vec![true, false], peer_choking: false });

        assert_eq!(torrent.rarest_first_order(), vec![1, 0]);
    }

    #[test]
    fn claim_piece_enforces_single_holder() {
        let mut torrent = Torrent::new(meta_two_pieces(), PathBuf::from("/tmp"));
        torrent.insert_peer(PeerView { addr: addr(1), piecefield: vec![true, true], peer_choking: false });
        torrent.insert_peer(PeerView { addr: addr(2), piecefield: vec![true, true], peer_choking: false });

        let first = torrent.claim_piece(addr(1)).unwrap();
        let second = torrent.claim_piece(addr(2)).unwrap();
        assert_ne!(first, second);
        assert_eq!(torrent.claim_holder(first), Some(addr(1)));
    }

    #[test]
    fn claim_piece_resumes_same_piece_across_multiple_blocks() {
        let meta = Metainfo {
            info_hash: [0u8; 20],
            piece_length: BLOCK_REQUEST_SIZE as u64 * 2,
            pieces: vec![[0u8; 20]],
            files: vec![FileEntry {
                relative_path: PathBuf::from("big.bin"),
                size_bytes: BLOCK_REQUEST_SIZE as u64 * 2,
                first_piece_index: 0,
            }],
            announce_tiers: vec![vec!["http://tracker.test".into()]],
            name: "big.bin".into(),
            comment: None,
            created_by: None,
        };
        let mut torrent = Torrent::new(meta, PathBuf::from("/tmp"));
        torrent.insert_peer(PeerView { addr: addr(1), piecefield: vec![true], peer_choking: false });

        let first_claim = torrent.claim_piece(addr(1)).unwrap();
        let first_request = torrent.next_block_request(first_claim).unwrap().unwrap();
        assert_eq!(first_request.offset, 0);
        assert_eq!(first_request.length, BLOCK_REQUEST_SIZE);

        let data = vec![0u8; BLOCK_REQUEST_SIZE as usize];
        torrent.receive_block(first_claim, 0, &data).unwrap();

        // A second call to claim_piece for the same address must resume the
        // piece it already holds instead of abandoning it for a new one.
        let second_claim = torrent.claim_piece(addr(1)).unwrap();
        assert_eq!(second_claim, first_claim);

        let second_request = torrent.next_block_request(second_claim).unwrap().unwrap();
        assert_eq!(second_request.offset, BLOCK_REQUEST_SIZE);
        assert_eq!(second_request.length, BLOCK_REQUEST_SIZE);
    }

    #[test]
    fn receive_block_straddling_two_files_splits_write() {
        let meta = Metainfo {
            info_hash: [0u8; 20],
            piece_length: 16,
            pieces: vec![[0u8; 20]],
            files: vec![
                FileEntry { relative_path: PathBuf::from("a.bin"), size_bytes: 10, first_piece_index: 0 },
                FileEntry { relative_path: PathBuf::from("b.bin"), size_bytes: 6, first_piece_index: 0 },
            ],
            announce_tiers: vec![vec!["http://tracker.test".into()]],
            name: "multi".into(),
            comment: None,
            created_by: None,
        };
        let torrent = Torrent::new(meta, PathBuf::from("/tmp"));
        let regions = torrent.file_regions_for_piece(0);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].path, PathBuf::from("a.bin"));
        assert_eq!(regions[0].length, 10);
        assert_eq!(regions[1].path, PathBuf::from("b.bin"));
        assert_eq!(regions[1].length, 6);
    }

    #[test]
    fn receive_block_hash_mismatch_releases_claim_for_reclaim() {
        let mut torrent = Torrent::new(meta_two_pieces(), PathBuf::from("/tmp"));
        torrent.insert_peer(PeerView { addr: addr(1), piecefield: vec![true, true], peer_choking: false });
        torrent.claim_piece(addr(1));

        let outcome = torrent.receive_block(0, 0, &[9u8; 16]).unwrap();
        assert_eq!(outcome, ReceiveOutcome::HashMismatch);
        assert_eq!(torrent.claim_holder(0), None);
        assert_eq!(torrent.piece_state(0), Some(PieceState::Empty));
    }
}
