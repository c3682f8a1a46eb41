//! Tracker client: HTTP announce requests, BEP-12 announce-list tiering,
//! and compact/non-compact peer list parsing.
use rand::Rng;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("tracker response was not valid bencode: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("tracker returned a failure reason: {0}")]
    Failure(String),

    #[error("every announce tier failed")]
    AllTiersFailed,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Which phase of a torrent's lifecycle this announce represents, per the
/// tracker protocol's optional `event` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    Regular,
}

impl AnnounceEvent {
    fn as_param(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Regular => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub numwant: u32,
    pub event: AnnounceEvent,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
struct RawTrackerResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: i64,
    #[serde(rename = "min interval")]
    min_interval: Option<i64>,
    #[serde(default)]
    peers: Peers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(#[serde(with = "serde_bytes")] Vec<u8>),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::Compact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

/// An HTTP tracker client for a single torrent, holding the peer identity
/// it announces with and the tracker-assigned `trackerid` once one arrives.
#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    peer_id: [u8; 20],
    port: u16,
    tracker_id: Option<String>,
}

impl Client {
    pub fn new(peer_id: [u8; 20], port: u16) -> Self {
        Client { http: reqwest::Client::new(), peer_id, port, tracker_id: None }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Announces across `tiers` using BEP-12 precedence: tracker URLs
    /// within a tier are tried in order, and the client moves to the next
    /// tier only once every URL in the current one has failed.
    #[instrument(skip(self, tiers), fields(event = ?request.event))]
    pub async fn announce(&mut self, tiers: &[Vec<String>], request: AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        for tier in tiers {
            for url in tier {
                match self.announce_one(url, &request).await {
                    Ok(response) => {
                        info!(%url, "announce successful");
                        return Ok(response);
                    }
                    Err(e) => {
                        warn!(%url, error = %e, "announce failed, trying next tracker");
                        continue;
                    }
                }
            }
        }
        Err(TrackerError::AllTiersFailed)
    }

    async fn announce_one(&mut self, announce_url: &str, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        let mut url = url::Url::parse(announce_url)?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("info_hash", &url_encode(&request.info_hash));
            params.append_pair("peer_id", &url_encode(&request.peer_id));
            params.append_pair("port", &request.port.to_string());
            params.append_pair("uploaded", &request.uploaded.to_string());
            params.append_pair("downloaded", &request.downloaded.to_string());
            params.append_pair("left", &request.left.to_string());
            params.append_pair("compact", "1");
            params.append_pair("numwant", &request.numwant.to_string());
            if let Some(event) = request.event.as_param() {
                params.append_pair("event", event);
            }
            if let Some(tracker_id) = &self.tracker_id {
                params.append_pair("trackerid", tracker_id);
            }
        }

        debug!(%url, "sending announce request");
        let response = self.http.get(url).send().await?;
        let bytes = response.bytes().await?;
        Self::parse_announce_response(&bytes)
    }

    fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
        let raw: RawTrackerResponse = serde_bencode::from_bytes(bytes)?;

        if let Some(reason) = raw.failure_reason {
            return Err(TrackerError::Failure(reason));
        }

        let peers = match raw.peers {
            Peers::Compact(bytes) => bytes
                .chunks_exact(6)
                .map(|chunk| Peer {
                    ip: IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
                    port: u16::from_be_bytes([chunk[4], chunk[5]]),
                })
                .collect(),
            Peers::NonCompact(dicts) => dicts.into_iter().filter_map(|d| d.ip.parse::<IpAddr>().ok().map(|ip| Peer { ip, port: d.port })).collect(),
        };

        Ok(AnnounceResponse {
            interval: raw.interval.max(0) as u64,
            min_interval: raw.min_interval.map(|i| i.max(0) as u64),
            peers,
        })
    }
}

pub fn interval_as_duration(response: &AnnounceResponse) -> Duration {
    Duration::from_secs(response.min_interval.unwrap_or(response.interval))
}

/// Generates a 20-byte Azureus-style peer id: an 8-byte client tag followed
/// by 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    peer_id
}

fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_peer_id_with_expected_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-RT0001-");
    }

    #[test]
    fn url_encodes_unreserved_characters_unchanged() {
        assert_eq!(url_encode(b"az09-._~"), "az09-._~");
    }

    #[test]
    fn url_encodes_reserved_bytes_as_percent_hex() {
        assert_eq!(url_encode(&[0x00, 0xff]), "%00%FF");
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers12:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe2]);
        body.extend_from_slice(b"e");

        let response = Client::parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].port, 6881);
    }

    #[test]
    fn surfaces_failure_reason_as_error() {
        let body = b"d14:failure reason17:torrent not founde";
        let err = Client::parse_announce_response(body).unwrap_err();
        assert!(matches!(err, TrackerError::Failure(_)));
    }
}
