//! `leechcore-cli`: a thin command-line shell around the `leechcore`
//! library. Parses a `.torrent` file, downloads it to the given output
//! path, and exits once every piece is verified.

use std::path::PathBuf;

use clap::Parser;
use leechcore::client::ClientConfig;
use leechcore::{Client, Metainfo};
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Leech a single-file torrent to disk")]
struct Cli {
    /// Path to the `.torrent` metainfo file.
    torrent: PathBuf,

    /// Path the downloaded file is written to.
    #[arg(short, long)]
    output: PathBuf,

    /// Local TCP port advertised to the tracker.
    #[arg(short, long, default_value_t = 6881)]
    port: u16,

    /// Number of concurrent peer workers.
    #[arg(short, long, default_value_t = 40)]
    workers: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let local = LocalSet::new();
    runtime.block_on(local.run_until(run(cli, &local)))
}

async fn run(cli: Cli, local: &LocalSet) -> anyhow::Result<()> {
    let data = std::fs::read(&cli.torrent)?;
    let metainfo = Metainfo::parse(&data)?;
    tracing::info!(
        name = %metainfo.name,
        info_hash = %hex::encode(metainfo.info_hash),
        pieces = metainfo.num_pieces(),
        "parsed torrent"
    );

    let config = ClientConfig {
        worker_count: cli.workers,
        listen_port: cli.port,
        ..ClientConfig::default()
    };

    let client = Client::new(metainfo, cli.output, config)?;
    client.run(local).await?;

    if client.is_complete() {
        tracing::info!("download complete");
    } else {
        tracing::warn!("session ended before every piece was verified");
    }
    Ok(())
}
