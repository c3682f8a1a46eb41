//! Bencode value model and error types.
//!
//! Bencode is the self-describing dictionary/list/integer/byte-string format
//! used by `.torrent` files and tracker responses. This module owns the
//! value model; [`decoder`] and [`encoder`] implement the actual parsing and
//! serialization.
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A decoded Bencode value.
///
/// Dictionary keys are raw byte strings, stored in insertion order. Encoding
/// always re-sorts keys into lexicographic order regardless of insertion
/// order, so `encode(decode(x))` reproduces the exact bytes a spec-compliant
/// bencoder would produce (this is what makes the `info_hash` reproducible).
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(Vec<(Vec<u8>, BencodeValue)>),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, BencodeValue)]> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key in a `Dict` value. Returns `None` for any other variant.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        match self {
            BencodeValue::Dict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Errors produced while decoding or encoding Bencode values.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer format")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("unexpected end of input")]
    UnexpectedEoi,

    #[error("cannot encode type: {0}")]
    CannotEncodeType(&'static str),

    #[error("dictionary keys must be byte strings")]
    DictKeyNotString,

    #[error("duplicate dictionary key")]
    DuplicateKey,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_get_finds_inserted_key() {
        let dict = BencodeValue::Dict(vec![(b"key".to_vec(), BencodeValue::String(b"value".to_vec()))]);
        assert_eq!(dict.get(b"key"), Some(&BencodeValue::String(b"value".to_vec())));
        assert_eq!(dict.get(b"missing"), None);
    }
}
