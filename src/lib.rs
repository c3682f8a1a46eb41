//! Library root for rs-torrent-client: a leeching BitTorrent peer engine.
//!
//! `bencode` and `torrent` implement the on-disk metainfo format and the
//! piece state machine; `wire` and `peer` implement the peer protocol;
//! `tracker` and `swarm` tie per-torrent announce loops and connections
//! together. `config` and `error` are the ambient CLI/error-handling layer.
pub mod bencode;
pub mod config;
pub mod error;
pub mod peer;
pub mod swarm;
pub mod torrent;
pub mod tracker;
pub mod wire;
