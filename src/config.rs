//! Runtime configuration: the tunables a client operator might reasonably
//! override, parsed from the command line via `clap`.
use clap::Parser;
use std::path::PathBuf;

/// A leeching BitTorrent peer engine.
#[derive(Debug, Parser, Clone)]
#[command(name = "rstc", version, about)]
pub struct Cli {
    /// Path to the `.torrent` metainfo file to download.
    pub torrent_path: PathBuf,

    /// Directory the downloaded files are written into.
    #[arg(long, default_value = "./downloads")]
    pub download_dir: PathBuf,

    /// TCP port this client listens on for incoming peer connections.
    #[arg(long, default_value_t = 6881)]
    pub listen_port: u16,

    /// Maximum number of simultaneously connected peers per torrent.
    #[arg(long, default_value_t = ClientConfig::default().max_peers)]
    pub max_peers: usize,

    /// Ceiling on new outbound connection attempts requested per announce.
    #[arg(long, default_value_t = ClientConfig::default().new_connection_limit)]
    pub new_connection_limit: usize,

    /// Block size requested per piece request, in bytes.
    #[arg(long, default_value_t = ClientConfig::default().block_request_size)]
    pub block_request_size: u32,

    /// Log filter directive, e.g. `debug`, `rs_torrent_client=trace`.
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

impl Cli {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            max_peers: self.max_peers,
            new_connection_limit: self.new_connection_limit,
            block_request_size: self.block_request_size,
        }
    }
}

/// The engine-facing subset of configuration, independent of how it was
/// sourced (CLI flags here; tests construct it directly via `Default`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    pub max_peers: usize,
    pub new_connection_limit: usize,
    pub block_request_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig { max_peers: 55, new_connection_limit: 30, block_request_size: 1 << 15 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.max_peers, 55);
        assert_eq!(config.new_connection_limit, 30);
        assert_eq!(config.block_request_size, 32768);
    }
}
