//! The fixed 68-byte handshake exchanged before any framed messages.
use crate::wire::{WireError, WireResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake { reserved: [0u8; 8], info_hash, peer_id }
    }

    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn parse(buf: &[u8; 68]) -> WireResult<Self> {
        let protocol_len = buf[0];
        if protocol_len != 19 {
            return Err(WireError::InvalidProtocolLength(protocol_len));
        }
        if &buf[1..20] != PROTOCOL.as_slice() {
            return Err(WireError::InvalidProtocolIdentifier(buf[1..20].to_vec()));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake { reserved, info_hash, peer_id })
    }

    #[instrument(level = "trace", skip(stream))]
    pub async fn write<W: AsyncWriteExt + Unpin>(&self, stream: &mut W) -> WireResult<()> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(stream))]
    pub async fn read<R: AsyncReadExt + Unpin>(stream: &mut R) -> WireResult<Self> {
        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await?;
        Self::parse(&buf)
    }

    pub fn validate_info_hash(&self, expected: [u8; 20]) -> WireResult<()> {
        if self.info_hash != expected {
            return Err(WireError::InfoHashMismatch { expected, got: self.info_hash });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_serialize_parse() {
        let hs = Handshake::new([7u8; 20], [9u8; 20]);
        let bytes = hs.serialize();
        let parsed = Handshake::parse(&bytes).unwrap();
        assert_eq!(parsed, hs);
    }

    #[test]
    fn rejects_wrong_protocol_length() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[0] = 18;
        assert!(matches!(Handshake::parse(&bytes), Err(WireError::InvalidProtocolLength(18))));
    }

    #[test]
    fn rejects_wrong_protocol_identifier() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[1] = b'X';
        assert!(matches!(Handshake::parse(&bytes), Err(WireError::InvalidProtocolIdentifier(_))));
    }

    #[test]
    fn validate_info_hash_detects_mismatch() {
        let hs = Handshake::new([1u8; 20], [0u8; 20]);
        assert!(hs.validate_info_hash([2u8; 20]).is_err());
        assert!(hs.validate_info_hash([1u8; 20]).is_ok());
    }
}
