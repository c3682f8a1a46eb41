//! Swarm coordinator: accepts inbound connections, dials outbound ones the
//! tracker hands back, and keeps one announce loop running per torrent.
//!
//! Grounded on the upstream `Client.on_incoming`/`add_torrent` pair (an
//! inbound connection is matched to a torrent by info_hash, then dropped if
//! `max_peers` is already reached) and `Torrent.announce`'s per-tier retry
//! loop, adapted to the parallel thread-per-task model: every connection
//! and every torrent's announce loop is its own tokio task, coordinating
//! only through the shared `Torrent` mutex and the connection registry
//! below.
use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::peer::connection::{run_active_loop, Connection};
use crate::torrent::engine::{PeerView, Torrent};
use crate::tracker::{AnnounceEvent, AnnounceRequest, Client as TrackerClient};
use crate::wire::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

type InfoHash = [u8; 20];

struct TorrentHandle {
    torrent: Arc<Mutex<Torrent>>,
    announce_tiers: Vec<Vec<String>>,
}

/// Whether an incoming or about-to-be-dialed connection should be accepted
/// given how many peers the torrent already has.
pub fn should_accept_connection(current_peers: usize, max_peers: usize) -> bool {
    current_peers < max_peers
}

/// How many new outbound connections a single announce round should ask
/// the tracker for: enough to top up to `max_peers`, capped by
/// `new_connection_limit`.
pub fn numwant(current_peers: usize, config: &ClientConfig) -> u32 {
    config.max_peers.saturating_sub(current_peers).min(config.new_connection_limit) as u32
}

/// Packs a per-piece bitfield into the MSB-first byte layout the wire
/// protocol expects, matching the unpacking in `Connection::apply_inbound`.
fn pack_bitfield(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, &has) in bits.iter().enumerate() {
        if has {
            bytes[i / 8] |= 1 << (7 - (i % 8));
        }
    }
    bytes
}

pub struct Swarm {
    config: ClientConfig,
    own_peer_id: [u8; 20],
    listen_port: u16,
    torrents: Arc<Mutex<HashMap<InfoHash, TorrentHandle>>>,
    connections: Arc<Mutex<HashMap<(InfoHash, SocketAddr), JoinHandle<()>>>>,
}

impl Swarm {
    pub fn new(config: ClientConfig, own_peer_id: [u8; 20], listen_port: u16) -> Self {
        Swarm {
            config,
            own_peer_id,
            listen_port,
            torrents: Arc::new(Mutex::new(HashMap::new())),
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn add_torrent(&self, info_hash: InfoHash, torrent: Arc<Mutex<Torrent>>, announce_tiers: Vec<Vec<String>>) {
        self.torrents.lock().await.insert(info_hash, TorrentHandle { torrent, announce_tiers });
    }

    /// Binds the listen port and accepts inbound connections for as long as
    /// the swarm runs. Each accepted stream is handed a task of its own
    /// after the handshake identifies which torrent it's for.
    #[instrument(skip(self))]
    pub async fn listen(self: Arc<Self>) -> ClientResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port)).await?;
        info!(port = self.listen_port, "listening for inbound peer connections");

        loop {
            let (stream, addr) = listener.accept().await?;
            let swarm = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = swarm.accept_inbound(stream, addr).await {
                    warn!(%addr, error = %e, "inbound connection failed");
                }
            });
        }
    }

    async fn accept_inbound(&self, mut stream: TcpStream, addr: SocketAddr) -> ClientResult<()> {
        // The first 68 bytes identify which torrent this connection is for;
        // peek the info_hash out without consuming the stream for the
        // handshake reader below.
        use crate::wire::Handshake;
        let handshake = Handshake::read(&mut stream).await?;

        let torrents = self.torrents.lock().await;
        let Some(handle) = torrents.get(&handshake.info_hash) else {
            warn!(%addr, "dropping connection: torrent not served");
            return Ok(());
        };
        let torrent = Arc::clone(&handle.torrent);
        drop(torrents);

        let current_peers = torrent.lock().await.peer_count();
        if !should_accept_connection(current_peers, self.config.max_peers) {
            warn!(%addr, "dropping connection: max_peers reached");
            return Ok(());
        }

        if self.connections.lock().await.contains_key(&(handshake.info_hash, addr)) {
            warn!(%addr, "dropping connection: already connected to this peer");
            return Ok(());
        }

        let ours = Handshake::new(handshake.info_hash, self.own_peer_id);
        ours.write(&mut stream).await?;

        self.run_connection(handshake.info_hash, addr, torrent, stream).await
    }

    /// Dials `addr` for `info_hash`, completes the handshake, and spawns
    /// its active-phase loop — used for outbound connections the tracker
    /// handed back.
    #[instrument(skip(self, torrent))]
    pub async fn connect_outbound(&self, info_hash: InfoHash, addr: SocketAddr, torrent: Arc<Mutex<Torrent>>) -> ClientResult<()> {
        let current_peers = torrent.lock().await.peer_count();
        if !should_accept_connection(current_peers, self.config.max_peers) {
            return Ok(());
        }

        if self.connections.lock().await.contains_key(&(info_hash, addr)) {
            return Ok(());
        }

        let stream = TcpStream::connect(addr).await?;
        self.run_connection(info_hash, addr, torrent, stream).await
    }

    async fn run_connection(
        &self,
        info_hash: InfoHash,
        addr: SocketAddr,
        torrent: Arc<Mutex<Torrent>>,
        mut stream: TcpStream,
    ) -> ClientResult<()> {
        let num_pieces = torrent.lock().await.num_pieces();
        let mut connection = Connection::new(addr, info_hash, self.own_peer_id, num_pieces);
        connection.handshake(&mut stream).await?;

        let local_bitfield = torrent.lock().await.local_bitfield();
        Message::Bitfield { bits: pack_bitfield(&local_bitfield) }.write(&mut stream).await?;

        torrent.lock().await.insert_peer(PeerView { addr, piecefield: vec![false; num_pieces], peer_choking: true });

        // The per-connection idle timeout is keyed off the tracker's
        // announce interval, but a connection outlives any single
        // announce round; 120s caps that timeout regardless of interval,
        // so it's used directly here.
        let tracker_interval = std::time::Duration::from_secs(120);

        let key = (info_hash, addr);
        let handle = tokio::spawn(async move {
            if let Err(e) = run_active_loop(&mut connection, &mut stream, Arc::clone(&torrent), tracker_interval).await {
                warn!(%addr, error = %e, "connection closed");
            }
            torrent.lock().await.remove_peer(addr);
        });
        self.connections.lock().await.insert(key, handle);
        Ok(())
    }

    /// Runs the announce loop for `info_hash` until the torrent completes:
    /// announce, dial back the peers the tracker returned (up to
    /// `new_connection_limit`), sleep for the tracker's interval, repeat.
    #[instrument(skip(self, torrent))]
    pub async fn run_announce_loop(&self, info_hash: InfoHash, torrent: Arc<Mutex<Torrent>>) -> ClientResult<()> {
        let announce_tiers = {
            let torrents = self.torrents.lock().await;
            torrents.get(&info_hash).map(|h| h.announce_tiers.clone()).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "torrent not registered with swarm")
            })?
        };

        let mut tracker = TrackerClient::new(self.own_peer_id, self.listen_port);
        let mut event = AnnounceEvent::Started;
        let mut sent_completed = false;

        loop {
            let (left, downloaded, uploaded, current_peers, is_complete) = {
                let t = torrent.lock().await;
                (t.left(), t.total_downloaded, t.total_uploaded, t.num_pieces(), t.is_complete())
            };

            if is_complete && !sent_completed {
                event = AnnounceEvent::Completed;
                sent_completed = true;
            }

            let request = AnnounceRequest {
                info_hash,
                peer_id: self.own_peer_id,
                port: self.listen_port,
                uploaded,
                downloaded,
                left,
                numwant: numwant(current_peers, &self.config),
                event,
            };

            match tracker.announce(&announce_tiers, request).await {
                Ok(response) => {
                    for peer in &response.peers {
                        let addr: SocketAddr = (peer.ip, peer.port).into();
                        let torrent = Arc::clone(&torrent);
                        let info_hash = info_hash;
                        if let Err(e) = self.connect_outbound(info_hash, addr, torrent).await {
                            warn!(%addr, error = %e, "outbound connection failed");
                        }
                    }
                    event = AnnounceEvent::Regular;
                    tokio::time::sleep(crate::tracker::interval_as_duration(&response)).await;
                }
                Err(e) => {
                    warn!(error = %e, "announce round failed, retrying after backoff");
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                }
            }
        }
    }
}
