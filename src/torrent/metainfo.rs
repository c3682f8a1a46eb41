//! Loads and validates a `.torrent` metainfo file.
//!
//! Reads a bencoded dictionary, computes the SHA-1 `info_hash` over the raw
//! `info` sub-value, and exposes the piece table, file table, and announce
//! tiers that the rest of the engine needs. The bencoding codec itself is a
//! collaborator, not part of this module.
use crate::bencode::{self, BencodeValue};
use crate::torrent::{TorrentError, TorrentResult};
use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// One file entry inside a (possibly multi-file) torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub relative_path: PathBuf,
    pub size_bytes: u64,
    /// The index of the first piece that contains data for this file.
    pub first_piece_index: usize,
}

/// Immutable, parsed view of a `.torrent` file, valid for the lifetime of
/// the torrent.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub announce_tiers: Vec<Vec<String>>,
    pub name: String,
    pub comment: Option<String>,
    pub created_by: Option<String>,
}

impl Metainfo {
    /// Parses a metainfo file's raw bytes (as read from disk).
    pub fn parse(raw: &[u8]) -> TorrentResult<Self> {
        let (root, _) = bencode::decoder::decode(raw)?;
        let root_dict = root
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidTorrent("root value is not a dictionary".into()))?;

        let info = find(root_dict, b"info")
            .ok_or_else(|| TorrentError::InvalidTorrent("missing 'info' dictionary".into()))?;
        let info_dict = info
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidTorrent("'info' is not a dictionary".into()))?;

        let info_hash = compute_info_hash(info)?;

        let piece_length = get_integer(info_dict, b"piece length")?
            .try_into()
            .map_err(|_| TorrentError::InvalidTorrent("negative piece length".into()))?;
        if piece_length == 0 {
            return Err(TorrentError::InvalidTorrent("piece length must be positive".into()));
        }

        let pieces_blob = get_bytes(info_dict, b"pieces")?;
        if pieces_blob.len() % 20 != 0 {
            return Err(TorrentError::InvalidTorrent("pieces length is not a multiple of 20".into()));
        }
        let pieces: Vec<[u8; 20]> = pieces_blob
            .chunks_exact(20)
            .map(|chunk| chunk.try_into().expect("chunks_exact(20) yields 20-byte slices"))
            .collect();

        let name = String::from_utf8_lossy(get_bytes(info_dict, b"name")?).into_owned();
        let files = parse_files(info_dict, &name, piece_length)?;

        let total_size: u64 = files.iter().map(|f| f.size_bytes).sum();
        let expected_pieces = total_size.div_ceil(piece_length) as usize;
        if pieces.len() != expected_pieces && total_size > 0 {
            return Err(TorrentError::InvalidTorrent(format!(
                "piece count {} does not match file sizes (expected {})",
                pieces.len(),
                expected_pieces
            )));
        }

        let announce_tiers = parse_announce_tiers(root_dict)?;

        let comment = find(root_dict, b"comment").and_then(|v| v.as_bytes()).map(to_string_lossy);
        let created_by = find(root_dict, b"created by").and_then(|v| v.as_bytes()).map(to_string_lossy);

        Ok(Metainfo {
            info_hash,
            piece_length,
            pieces,
            files,
            announce_tiers,
            name,
            comment,
            created_by,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`: `piece_length` for every piece except the
    /// last, whose length is the remainder of `total_size`. The metainfo
    /// does not carry this explicitly; it must be derived.
    pub fn piece_length_at(&self, index: usize) -> u64 {
        if index + 1 == self.pieces.len() {
            let full = (self.pieces.len() as u64 - 1) * self.piece_length;
            self.total_size() - full
        } else {
            self.piece_length
        }
    }
}

fn to_string_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn find<'a>(dict: &'a [(Vec<u8>, BencodeValue)], key: &[u8]) -> Option<&'a BencodeValue> {
    dict.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn get_integer(dict: &[(Vec<u8>, BencodeValue)], key: &'static [u8]) -> TorrentResult<i64> {
    find(dict, key)
        .and_then(BencodeValue::as_integer)
        .ok_or_else(|| TorrentError::InvalidTorrent(format!("missing or non-integer field '{}'", String::from_utf8_lossy(key))))
}

fn get_bytes<'a>(dict: &'a [(Vec<u8>, BencodeValue)], key: &'static [u8]) -> TorrentResult<&'a [u8]> {
    find(dict, key)
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| TorrentError::InvalidTorrent(format!("missing or non-string field '{}'", String::from_utf8_lossy(key))))
}

fn compute_info_hash(info: &BencodeValue) -> TorrentResult<[u8; 20]> {
    let encoded = bencode::encoder::encode_to_vec(info)?;
    let digest = Sha1::digest(&encoded);
    Ok(digest.into())
}

fn parse_files(info_dict: &[(Vec<u8>, BencodeValue)], name: &str, piece_length: u64) -> TorrentResult<Vec<FileEntry>> {
    if let Some(BencodeValue::List(entries)) = find(info_dict, b"files") {
        let mut files = Vec::with_capacity(entries.len());
        let mut next_piece_index = 0usize;

        for entry in entries {
            let entry_dict = entry
                .as_dict()
                .ok_or_else(|| TorrentError::InvalidTorrent("file entry is not a dictionary".into()))?;
            let size_bytes: u64 = get_integer(entry_dict, b"length")?
                .try_into()
                .map_err(|_| TorrentError::InvalidTorrent("negative file length".into()))?;
            let path_parts = find(entry_dict, b"path")
                .and_then(BencodeValue::as_list)
                .ok_or_else(|| TorrentError::InvalidTorrent("file entry missing 'path'".into()))?;

            let mut relative_path = PathBuf::from(name);
            for part in path_parts {
                let part = part.as_bytes().ok_or_else(|| TorrentError::InvalidTorrent("path component not a string".into()))?;
                relative_path.push(String::from_utf8_lossy(part).into_owned());
            }

            files.push(FileEntry { relative_path, size_bytes, first_piece_index: next_piece_index });
            next_piece_index += (size_bytes.div_ceil(piece_length.max(1))) as usize;
        }

        Ok(files)
    } else {
        let size_bytes: u64 = get_integer(info_dict, b"length")
            .map_err(|_| TorrentError::InvalidTorrent("single-file torrent missing 'length'".into()))?
            .try_into()
            .map_err(|_| TorrentError::InvalidTorrent("negative file length".into()))?;

        Ok(vec![FileEntry { relative_path: PathBuf::from(name), size_bytes, first_piece_index: 0 }])
    }
}

/// BEP-12 precedence: `announce-list`, verbatim, if present; otherwise a
/// single tier wrapping the lone `announce` URL.
fn parse_announce_tiers(root_dict: &[(Vec<u8>, BencodeValue)]) -> TorrentResult<Vec<Vec<String>>> {
    if let Some(BencodeValue::List(tiers)) = find(root_dict, b"announce-list") {
        let mut result = Vec::with_capacity(tiers.len());
        for tier in tiers {
            let tier_list = tier.as_list().ok_or_else(|| TorrentError::InvalidTorrent("announce-list tier is not a list".into()))?;
            let mut urls = Vec::with_capacity(tier_list.len());
            for url in tier_list {
                let bytes = url.as_bytes().ok_or_else(|| TorrentError::InvalidTorrent("announce URL is not a string".into()))?;
                urls.push(to_string_lossy(bytes));
            }
            result.push(urls);
        }
        if result.is_empty() || result.iter().all(|t| t.is_empty()) {
            return Err(TorrentError::InvalidTorrent("announce-list has no URLs".into()));
        }
        Ok(result)
    } else if let Some(announce) = find(root_dict, b"announce").and_then(BencodeValue::as_bytes) {
        Ok(vec![vec![to_string_lossy(announce)]])
    } else {
        Err(TorrentError::InvalidTorrent("no announce URL or announce-list present".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent(piece_length: i64, pieces_blob: &[u8], data_len: i64) -> Vec<u8> {
        let info = BencodeValue::Dict(vec![
            (b"length".to_vec(), BencodeValue::Integer(data_len)),
            (b"name".to_vec(), BencodeValue::String(b"data".to_vec())),
            (b"piece length".to_vec(), BencodeValue::Integer(piece_length)),
            (b"pieces".to_vec(), BencodeValue::String(pieces_blob.to_vec())),
        ]);
        let root = BencodeValue::Dict(vec![
            (b"announce".to_vec(), BencodeValue::String(b"http://tracker.test".to_vec())),
            (b"info".to_vec(), info),
        ]);
        bencode::encoder::encode_to_vec(&root).unwrap()
    }

    #[test]
    fn parses_single_file_torrent() {
        let data = vec![1u8; 16];
        let hash: [u8; 20] = Sha1::digest(&data).into();
        let raw = single_file_torrent(16, &hash, 16);
        let meta = Metainfo::parse(&raw).unwrap();
        assert_eq!(meta.num_pieces(), 1);
        assert_eq!(meta.total_size(), 16);
        assert_eq!(meta.announce_tiers, vec![vec!["http://tracker.test".to_string()]]);
        assert_eq!(meta.piece_length_at(0), 16);
    }

    #[test]
    fn rejects_pieces_not_multiple_of_twenty() {
        let raw = single_file_torrent(16, &[1u8; 19], 16);
        assert!(Metainfo::parse(&raw).is_err());
    }

    #[test]
    fn info_hash_is_deterministic_for_same_info_bytes() {
        let hash: [u8; 20] = Sha1::digest([7u8; 16]).into();
        let raw = single_file_torrent(16, &hash, 16);
        let a = Metainfo::parse(&raw).unwrap();
        let b = Metainfo::parse(&raw).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }

    #[test]
    fn derives_last_piece_length_from_remainder() {
        let hash0: [u8; 20] = Sha1::digest([1u8; 16]).into();
        let hash1: [u8; 20] = Sha1::digest([2u8; 8]).into();
        let mut pieces_blob = Vec::new();
        pieces_blob.extend_from_slice(&hash0);
        pieces_blob.extend_from_slice(&hash1);
        let raw = single_file_torrent(16, &pieces_blob, 24);
        let meta = Metainfo::parse(&raw).unwrap();
        assert_eq!(meta.num_pieces(), 2);
        assert_eq!(meta.piece_length_at(0), 16);
        assert_eq!(meta.piece_length_at(1), 8);
    }
}
