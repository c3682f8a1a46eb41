use anyhow::{Context, Result};
use clap::Parser;
use rs_torrent_client::config::Cli;
use rs_torrent_client::swarm::Swarm;
use rs_torrent_client::torrent::engine::Torrent as TorrentEngine;
use rs_torrent_client::torrent::metainfo::Metainfo;
use rs_torrent_client::tracker::generate_peer_id;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log_filter)).init();

    let raw = std::fs::read(&cli.torrent_path).with_context(|| format!("reading {}", cli.torrent_path.display()))?;
    let metainfo = Metainfo::parse(&raw).context("parsing torrent metainfo")?;
    info!(name = %metainfo.name, pieces = metainfo.num_pieces(), "loaded torrent");

    let announce_tiers = metainfo.announce_tiers.clone();
    let info_hash = metainfo.info_hash;
    let engine = TorrentEngine::new(metainfo, cli.download_dir.clone());
    let torrent = Arc::new(Mutex::new(engine));

    let peer_id = generate_peer_id();
    let swarm = Arc::new(Swarm::new(cli.client_config(), peer_id, cli.listen_port));
    swarm.add_torrent(info_hash, Arc::clone(&torrent), announce_tiers).await;

    let listen_swarm = Arc::clone(&swarm);
    let listen_task = tokio::spawn(async move {
        if let Err(e) = listen_swarm.listen().await {
            tracing::error!(error = %e, "listener stopped");
        }
    });

    swarm.run_announce_loop(info_hash, torrent).await?;
    listen_task.abort();
    Ok(())
}
