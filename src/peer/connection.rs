//! Drives one peer connection: handshake, then dispatch each inbound
//! message to the shared `Torrent` and decide what to send back.
//!
//! Each inbound message is handled synchronously by `apply_inbound` as soon
//! as it arrives, rather than driving a generator-style state machine —
//! the response to any given message only ever depends on the connection's
//! own fields and the shared torrent state at that moment.
use crate::peer::{InterestState, PeerError, PeerResult};
use crate::torrent::engine::{PeerView, ReceiveOutcome, Torrent};
use crate::wire::{Handshake, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// The idle ceiling a connection will tolerate with no traffic at all
/// before it's presumed dead: `min(2 * tracker_interval, 120s)`.
pub fn idle_timeout(tracker_interval: Duration) -> Duration {
    (tracker_interval * 2).min(Duration::from_secs(120))
}

pub struct Connection {
    pub addr: SocketAddr,
    pub info_hash: [u8; 20],
    pub own_peer_id: [u8; 20],
    pub remote_peer_id: Option<[u8; 20]>,
    pub state: ConnectionState,
    pub interest: InterestState,
    piecefield: Vec<bool>,
}

impl Connection {
    pub fn new(addr: SocketAddr, info_hash: [u8; 20], own_peer_id: [u8; 20], num_pieces: usize) -> Self {
        Connection {
            addr,
            info_hash,
            own_peer_id,
            remote_peer_id: None,
            state: ConnectionState::Connecting,
            interest: InterestState::default(),
            piecefield: vec![false; num_pieces],
        }
    }

    #[instrument(skip(self, stream), fields(peer = %self.addr))]
    pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(&mut self, stream: &mut S) -> PeerResult<()> {
        self.state = ConnectionState::Handshaking;
        let ours = Handshake::new(self.info_hash, self.own_peer_id);
        ours.write(stream).await?;

        let theirs = Handshake::read(stream).await?;
        theirs.validate_info_hash(self.info_hash)?;

        self.remote_peer_id = Some(theirs.peer_id);
        self.state = ConnectionState::Active;
        info!("handshake complete");
        Ok(())
    }

    /// Applies one inbound message against the shared torrent state and
    /// returns whatever outbound messages should be sent in response. This
    /// is the entire connection state machine: no coroutine, no generator,
    /// just a function from (message, shared state) to (new local state,
    /// outbound messages).
    #[instrument(skip(self, torrent, msg), fields(peer = %self.addr))]
    pub fn apply_inbound(&mut self, msg: Message, torrent: &mut Torrent) -> PeerResult<Vec<Message>> {
        if self.state != ConnectionState::Active {
            return Err(PeerError::MessageBeforeHandshake);
        }

        match msg {
            Message::KeepAlive => Ok(vec![]),
            Message::Choke => {
                self.interest.peer_choking = true;
                Ok(vec![])
            }
            Message::Unchoke => {
                self.interest.peer_choking = false;
                Ok(self.next_request(torrent).into_iter().collect())
            }
            Message::Interested => {
                self.interest.peer_interested = true;
                Ok(vec![])
            }
            Message::NotInterested => {
                self.interest.peer_interested = false;
                Ok(vec![])
            }
            Message::Have { piece_index } => {
                self.mark_have(torrent, piece_index as usize, true);
                let mut outbound = self.update_interest(torrent);
                outbound.extend(self.next_request(torrent));
                Ok(outbound)
            }
            Message::Bitfield { bits } => {
                for i in 0..self.piecefield.len() {
                    let byte = bits.get(i / 8).copied().unwrap_or(0);
                    let has = (byte >> (7 - (i % 8))) & 1 == 1;
                    self.piecefield[i] = has;
                }
                torrent.insert_peer(PeerView {
                    addr: self.addr,
                    piecefield: self.piecefield.clone(),
                    peer_choking: self.interest.peer_choking,
                });
                let mut outbound = self.update_interest(torrent);
                outbound.extend(self.next_request(torrent));
                Ok(outbound)
            }
            Message::Request { piece_index, offset, length } => {
                debug!(piece_index, offset, length, "ignoring upload request: this client does not seed");
                Ok(vec![])
            }
            Message::Piece { piece_index, offset, data } => {
                let outcome = torrent.receive_block(piece_index as usize, offset, &data)?;
                if let ReceiveOutcome::Verified(_) = outcome {
                    torrent.save_piece(piece_index as usize)?;
                }
                Ok(self.next_request(torrent).into_iter().collect())
            }
            Message::Cancel { .. } => Ok(vec![]),
            Message::Port { .. } => Ok(vec![]),
        }
    }

    fn mark_have(&mut self, torrent: &mut Torrent, index: usize, have: bool) {
        if index < self.piecefield.len() {
            self.piecefield[index] = have;
        }
        torrent.update_peer_piece(self.addr, index, have);
    }

    /// Sends `Interested` the first time this peer has something we still
    /// need, and `NotInterested` once it no longer does.
    fn update_interest(&mut self, torrent: &Torrent) -> Vec<Message> {
        let has_needed_piece = self
            .piecefield
            .iter()
            .enumerate()
            .any(|(i, &has)| has && !matches!(torrent.piece_state(i), Some(crate::torrent::PieceState::Verified | crate::torrent::PieceState::Saved)));

        if has_needed_piece && !self.interest.am_interested {
            self.interest.am_interested = true;
            vec![Message::Interested]
        } else if !has_needed_piece && self.interest.am_interested {
            self.interest.am_interested = false;
            vec![Message::NotInterested]
        } else {
            vec![]
        }
    }

    /// Claims a piece (if this connection isn't already holding one) and
    /// asks for its next unfilled block.
    fn next_request(&mut self, torrent: &mut Torrent) -> Option<Message> {
        if self.interest.peer_choking {
            return None;
        }

        let claimed = torrent.claim_piece(self.addr)?;
        match torrent.next_block_request(claimed).ok().flatten() {
            Some(req) => Some(Message::Request { piece_index: req.piece_index as u32, offset: req.offset, length: req.length }),
            None => {
                torrent.release_claim(claimed);
                None
            }
        }
    }
}

/// Runs the active-phase message loop: reads frames off `stream`, applies
/// them against `torrent`, writes back whatever responses result, and bails
/// out once `idle_timeout` passes with no traffic either direction.
#[instrument(skip(connection, stream, torrent))]
pub async fn run_active_loop<S: AsyncRead + AsyncWrite + Unpin>(
    connection: &mut Connection,
    stream: &mut S,
    torrent: Arc<Mutex<Torrent>>,
    tracker_interval: Duration,
) -> PeerResult<()> {
    let timeout = idle_timeout(tracker_interval);
    loop {
        let msg = tokio::time::timeout(timeout, Message::read(stream))
            .await
            .map_err(|_| PeerError::Timeout)??;

        let outbound = {
            let mut guard = torrent.lock().await;
            connection.apply_inbound(msg, &mut guard)?
        };

        for out in outbound {
            out.write(stream).await?;
        }
    }
}
