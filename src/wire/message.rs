//! The length-prefixed message stream that follows the handshake.
//!
//! Every message is `<u32 length prefix><u8 id><payload>`, big-endian,
//! except the zero-length keep-alive which has no id or payload at all.
use crate::wire::{WireError, WireResult};
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bits: Vec<u8> },
    Request { piece_index: u32, offset: u32, length: u32 },
    Piece { piece_index: u32, offset: u32, data: Vec<u8> },
    Cancel { piece_index: u32, offset: u32, length: u32 },
    Port { listen_port: u16 },
}

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have { .. } => Some(4),
            Message::Bitfield { .. } => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
            Message::Port { .. } => Some(9),
        }
    }

    /// Serializes this message into its wire form, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let id = match self.id() {
            None => return vec![0, 0, 0, 0],
            Some(id) => id,
        };

        let mut body = Vec::new();
        match self {
            Message::Have { piece_index } => body.extend_from_slice(&piece_index.to_be_bytes()),
            Message::Bitfield { bits } => body.extend_from_slice(bits),
            Message::Request { piece_index, offset, length } | Message::Cancel { piece_index, offset, length } => {
                body.extend_from_slice(&piece_index.to_be_bytes());
                body.extend_from_slice(&offset.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece { piece_index, offset, data } => {
                body.extend_from_slice(&piece_index.to_be_bytes());
                body.extend_from_slice(&offset.to_be_bytes());
                body.extend_from_slice(data);
            }
            Message::Port { listen_port } => body.extend_from_slice(&listen_port.to_be_bytes()),
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::KeepAlive => unreachable!(),
        }

        let len = 1 + body.len() as u32;
        let mut buf = Vec::with_capacity(4 + len as usize);
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(id);
        buf.extend_from_slice(&body);
        buf
    }

    /// Parses a message body (everything after the length prefix and the id
    /// byte, which the caller has already stripped off and passed as `id`).
    /// `body` is empty for fixed-size messages that carry no payload.
    fn decode_body(id: u8, body: &[u8]) -> WireResult<Self> {
        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => {
                if body.len() != 4 {
                    return Err(malformed(id, "have requires a 4-byte piece index"));
                }
                Ok(Message::Have { piece_index: BigEndian::read_u32(body) })
            }
            5 => Ok(Message::Bitfield { bits: body.to_vec() }),
            6 => {
                let (piece_index, offset, length) = read_three_u32(id, body)?;
                Ok(Message::Request { piece_index, offset, length })
            }
            7 => {
                if body.len() < 8 {
                    return Err(malformed(id, "piece requires at least 8 bytes of header"));
                }
                Ok(Message::Piece {
                    piece_index: BigEndian::read_u32(&body[0..4]),
                    offset: BigEndian::read_u32(&body[4..8]),
                    data: body[8..].to_vec(),
                })
            }
            8 => {
                let (piece_index, offset, length) = read_three_u32(id, body)?;
                Ok(Message::Cancel { piece_index, offset, length })
            }
            9 => {
                if body.len() != 2 {
                    return Err(malformed(id, "port requires a 2-byte value"));
                }
                Ok(Message::Port { listen_port: BigEndian::read_u16(body) })
            }
            other => Err(WireError::UnknownMessageId(other)),
        }
    }

    /// Reads exactly one framed message (or keep-alive) from `stream`.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read<R: AsyncReadExt + Unpin>(stream: &mut R) -> WireResult<Self> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);

        if len == 0 {
            return Ok(Message::KeepAlive);
        }

        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await?;
        let id = payload[0];
        Self::decode_body(id, &payload[1..])
    }

    #[instrument(level = "trace", skip(self, stream))]
    pub async fn write<W: AsyncWriteExt + Unpin>(&self, stream: &mut W) -> WireResult<()> {
        stream.write_all(&self.encode()).await?;
        Ok(())
    }
}

fn malformed(id: u8, reason: &str) -> WireError {
    WireError::MalformedMessage { id, reason: reason.to_string() }
}

fn read_three_u32(id: u8, body: &[u8]) -> WireResult<(u32, u32, u32)> {
    if body.len() != 12 {
        return Err(malformed(id, "expected 12 bytes (three u32 fields)"));
    }
    Ok((BigEndian::read_u32(&body[0..4]), BigEndian::read_u32(&body[4..8]), BigEndian::read_u32(&body[8..12])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let encoded = msg.encode();
        let len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        let decoded = if len == 0 { Message::KeepAlive } else { Message::decode_body(encoded[4], &encoded[5..]).unwrap() };
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trips_fixed_messages() {
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have { piece_index: 42 });
        round_trip(Message::Bitfield { bits: vec![0xff, 0x00, 0x80] });
        round_trip(Message::Request { piece_index: 1, offset: 16384, length: 32768 });
        round_trip(Message::Piece { piece_index: 1, offset: 0, data: vec![1, 2, 3, 4] });
        round_trip(Message::Cancel { piece_index: 1, offset: 16384, length: 32768 });
        round_trip(Message::Port { listen_port: 6881 });
    }

    #[test]
    fn keep_alive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn rejects_unknown_message_id() {
        assert!(matches!(Message::decode_body(200, &[]), Err(WireError::UnknownMessageId(200))));
    }

    #[test]
    fn rejects_truncated_have_payload() {
        assert!(Message::decode_body(4, &[0, 1]).is_err());
    }

    #[tokio::test]
    async fn reads_two_messages_streamed_five_bytes_at_a_time() {
        let mut encoded = Message::Interested.encode();
        encoded.extend(Message::Have { piece_index: 3 }.encode());

        // Feed the reader through a cursor that only ever yields up to 5
        // bytes per poll, to exercise `read_exact`'s internal looping.
        struct Chunked<'a> {
            data: &'a [u8],
            pos: usize,
        }
        impl<'a> tokio::io::AsyncRead for Chunked<'a> {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                let remaining = &self.data[self.pos..];
                let n = remaining.len().min(5).min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                self.pos += n;
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut reader = Chunked { data: &encoded, pos: 0 };
        let first = Message::read(&mut reader).await.unwrap();
        let second = Message::read(&mut reader).await.unwrap();
        assert_eq!(first, Message::Interested);
        assert_eq!(second, Message::Have { piece_index: 3 });
    }
}
