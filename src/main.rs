use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use swarmlink::{Client, Config, Torrent, logging};
use tracing::{Level, info};

#[derive(Parser)]
#[command(name = "swarmlink", version)]
#[command(about = "A BitTorrent client with encrypted connections")]
struct Cli {
    /// toml config file, defaults are used without one
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: Level,
    /// also write a trace level log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download (or seed) the content of a torrent file until interrupted
    Download {
        torrent: PathBuf,
        /// Output directory, the config's download dir by default
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print what a torrent file contains
    Info { torrent: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level, cli.log_file.as_deref()).context("setting up logging")?;

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Download { torrent, output } => download(config, torrent, output).await,
        Commands::Info { torrent } => print_info(torrent),
    }
}

async fn download(config: Config, torrent: PathBuf, output: Option<PathBuf>) -> anyhow::Result<()> {
    let torrent = Torrent::read_from_file(&torrent)?;
    let dest = output.unwrap_or_else(|| config.download_dir.clone());

    let mut client = Client::new(config);
    let addr = client.listen().await.context("starting the listener")?;
    info!(%addr, "accepting peers");
    let handle = client
        .start_transfer(torrent, &dest)
        .await
        .context("starting the transfer")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");
    client.shutdown();
    handle.wait().await?;
    Ok(())
}

fn print_info(torrent: PathBuf) -> anyhow::Result<()> {
    let torrent = Torrent::read_from_file(&torrent)?;
    println!("Info Hash: {}", torrent.info_hash());
    println!("Name: {}", torrent.info.name);
    println!("Length: {}", torrent.info.total_length());
    println!("Piece Length: {}", torrent.info.piece_length);
    println!("Pieces: {}", torrent.info.piece_count());
    for url in torrent.announce_urls() {
        println!("Tracker URL: {url}");
    }
    for entry in torrent.info.file_entries() {
        println!("File: {} ({} bytes)", entry.path.display(), entry.length);
    }
    Ok(())
}
